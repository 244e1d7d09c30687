//! Logical tensor name normalization.
//!
//! Upstream conversions disagree on tensor naming (`layers.0.attention.wq`
//! vs `model.layers.0.self_attn.q_proj.weight`). Resolution is pure string
//! rewriting: the requested name is tried first, then its canonical form.

/// Candidate names for a lookup, most specific first. The requested name
/// always leads; rewriting never does I/O.
pub fn candidates(name: &str) -> Vec<String> {
    let canonical = canonicalize(name);
    if canonical == name {
        vec![name.to_string()]
    } else {
        vec![name.to_string(), canonical]
    }
}

/// Rewrite a llama.cpp-style name to the `model.layers.N.…` convention.
/// Names already canonical (or unknown) pass through unchanged.
pub fn canonicalize(name: &str) -> String {
    match name {
        "tok_embeddings.weight" => return "model.embed_tokens.weight".to_string(),
        "norm.weight" => return "model.norm.weight".to_string(),
        "output.weight" => return "lm_head.weight".to_string(),
        _ => {}
    }

    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() < 4 || parts[0] != "layers" || parts.last().copied() != Some("weight") {
        return name.to_string();
    }
    let layer = parts[1];

    let mapped = match (parts[2], parts.get(3)) {
        ("attention", Some(&"wq")) => Some("self_attn.q_proj"),
        ("attention", Some(&"wk")) => Some("self_attn.k_proj"),
        ("attention", Some(&"wv")) => Some("self_attn.v_proj"),
        ("attention", Some(&"wo")) => Some("self_attn.o_proj"),
        ("feed_forward", Some(&"w1")) => Some("mlp.gate_proj"),
        ("feed_forward", Some(&"w2")) => Some("mlp.down_proj"),
        ("feed_forward", Some(&"w3")) => Some("mlp.up_proj"),
        ("attention_norm", Some(&"weight")) => Some("input_layernorm"),
        ("ffn_norm", Some(&"weight")) => Some("post_attention_layernorm"),
        _ => None,
    };

    match mapped {
        Some(suffix) => format!("model.layers.{layer}.{suffix}.weight"),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attention_rewrites() {
        assert_eq!(
            canonicalize("layers.3.attention.wq.weight"),
            "model.layers.3.self_attn.q_proj.weight"
        );
        assert_eq!(
            canonicalize("layers.12.attention.wo.weight"),
            "model.layers.12.self_attn.o_proj.weight"
        );
    }

    #[test]
    fn test_ffn_and_norm_rewrites() {
        assert_eq!(
            canonicalize("layers.0.feed_forward.w1.weight"),
            "model.layers.0.mlp.gate_proj.weight"
        );
        assert_eq!(
            canonicalize("layers.0.feed_forward.w2.weight"),
            "model.layers.0.mlp.down_proj.weight"
        );
        assert_eq!(
            canonicalize("layers.5.attention_norm.weight"),
            "model.layers.5.input_layernorm.weight"
        );
        assert_eq!(
            canonicalize("layers.5.ffn_norm.weight"),
            "model.layers.5.post_attention_layernorm.weight"
        );
    }

    #[test]
    fn test_top_level_rewrites() {
        assert_eq!(canonicalize("tok_embeddings.weight"), "model.embed_tokens.weight");
        assert_eq!(canonicalize("output.weight"), "lm_head.weight");
        assert_eq!(canonicalize("norm.weight"), "model.norm.weight");
    }

    #[test]
    fn test_idempotent() {
        let once = canonicalize("layers.2.attention.wk.weight");
        let twice = canonicalize(&once);
        assert_eq!(once, twice);

        // Canonical names pass through untouched.
        assert_eq!(
            canonicalize("model.layers.2.self_attn.k_proj.weight"),
            "model.layers.2.self_attn.k_proj.weight"
        );
    }

    #[test]
    fn test_candidates_order() {
        let c = candidates("layers.0.attention.wq.weight");
        assert_eq!(c.len(), 2);
        assert_eq!(c[0], "layers.0.attention.wq.weight");
        assert_eq!(c[1], "model.layers.0.self_attn.q_proj.weight");

        let c = candidates("model.norm.weight");
        assert_eq!(c, vec!["model.norm.weight"]);
    }

    #[test]
    fn test_unknown_names_pass_through() {
        assert_eq!(canonicalize("rotary.freqs"), "rotary.freqs");
        assert_eq!(canonicalize("layers.0.unknown.weight"), "layers.0.unknown.weight");
    }
}
