//! Token accounting for cached tools

use once_cell::sync::Lazy;
use serde_json::Value;
use tiktoken_rs::CoreBPE;

/// Process-wide tokenizer. `None` when the encoder tables fail to load, in
/// which case counting falls back to a bytes/4 estimate.
static BPE: Lazy<Option<CoreBPE>> = Lazy::new(|| match tiktoken_rs::cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(err) => {
        tracing::warn!(error = %err, "tokenizer unavailable, falling back to byte estimate");
        None
    }
});

/// Count tokens in `text` with the GPT-class tokenizer, or `⌈bytes/4⌉` when
/// the tokenizer is unavailable.
pub fn count_tokens(text: &str) -> usize {
    match BPE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.len().div_ceil(4),
    }
}

/// The exact text a tool contributes to the upstream context window: its
/// qualified name, its description prefixed with the bracketed server name,
/// and the compact schema JSON.
pub fn aggregated_tool_text(server: &str, tool: &str, description: &str, schema: &Value) -> String {
    let schema_json = serde_json::to_string(schema).unwrap_or_default();
    format!("{server}.{tool} [{server}] {description} {schema_json}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn count_is_positive_for_non_empty_text() {
        assert!(count_tokens("read a file from disk") > 0);
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn aggregated_text_includes_qualification() {
        let text = aggregated_tool_text(
            "myfs",
            "fs.read_file",
            "Read a file",
            &json!({"type": "object"}),
        );
        assert!(text.starts_with("myfs.fs.read_file [myfs] Read a file"));
        assert!(text.contains("{\"type\":\"object\"}"));
    }

    #[test]
    fn count_depends_on_server_name() {
        let schema = json!({"type": "object"});
        let short = aggregated_tool_text("a", "t", "d", &schema);
        let long = aggregated_tool_text("a-much-longer-server-name", "t", "d", &schema);
        assert!(count_tokens(&long) > count_tokens(&short));
    }
}
