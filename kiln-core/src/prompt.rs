//! Prompt preparation: tokenization with BOS rules, infill splicing,
//! image-marker parsing, middle-block truncation and prefix diffing.

use kiln_llama::{LlamaEngine, LlamaToken};

use crate::image::SlotImage;
use crate::params::{PromptInput, PromptSegment};
use crate::CoreError;

/// Tokenize a prompt.
///
/// `add_bos` only applies when the prompt is a plain string, or when the
/// first element of a segment sequence is a string; raw token-id segments
/// are inserted verbatim.
pub(crate) fn tokenize_prompt(
    engine: &dyn LlamaEngine,
    prompt: &PromptInput,
    add_bos: bool,
) -> Result<Vec<LlamaToken>, CoreError> {
    match prompt {
        PromptInput::Text(text) => Ok(engine.tokenize(text, add_bos, true)?),
        PromptInput::Segments(segments) => {
            let mut tokens = Vec::new();
            let mut first = true;
            for segment in segments {
                match segment {
                    PromptSegment::Text(text) => {
                        tokens.extend(engine.tokenize(text, first && add_bos, true)?);
                    }
                    PromptSegment::Token(token) => tokens.push(*token),
                }
                first = false;
            }
            Ok(tokens)
        }
    }
}

/// Assemble the infill layout:
/// `[BOS, PRE, <prefix tokens>, SUF, <suffix tokens>, MID]`.
///
/// A single leading space on the suffix is dropped, either from the text
/// before tokenizing or as a leading space token afterwards.
pub(crate) fn build_infill_prompt(
    engine: &dyn LlamaEngine,
    input_prefix: &str,
    input_suffix: &str,
) -> Result<Vec<LlamaToken>, CoreError> {
    let mut suffix = input_suffix;
    let mut suffix_rm_leading_space = true;
    if suffix.starts_with(' ') && suffix.len() > 1 {
        suffix = &suffix[1..];
        suffix_rm_leading_space = false;
    }

    let prefix_tokens = engine.tokenize(input_prefix, false, false)?;
    let mut suffix_tokens = engine.tokenize(suffix, false, false)?;
    if suffix_rm_leading_space {
        let space = engine.tokenize(" ", false, false)?;
        if !suffix_tokens.is_empty() && space.first() == suffix_tokens.first() {
            suffix_tokens.remove(0);
        }
    }

    let mut tokens = Vec::with_capacity(prefix_tokens.len() + suffix_tokens.len() + 4);
    tokens.push(engine.token_bos());
    tokens.push(engine.token_prefix());
    tokens.extend(prefix_tokens);
    tokens.push(engine.token_suffix());
    tokens.extend(suffix_tokens);
    tokens.push(engine.token_middle());
    Ok(tokens)
}

/// Drop whole blocks of size `(n_ctx - n_keep) / 2` from the middle of an
/// oversized prompt, keeping the first `n_keep` tokens and the tail.
pub(crate) fn truncate_middle(
    tokens: &[LlamaToken],
    n_keep: usize,
    n_ctx: usize,
) -> Vec<LlamaToken> {
    debug_assert!(tokens.len() >= n_ctx);
    let n_left = n_ctx - n_keep;
    let block_size = n_left / 2;
    let erased_blocks = (tokens.len() - n_keep - block_size) / block_size;

    let mut out = Vec::with_capacity(n_ctx);
    out.extend_from_slice(&tokens[..n_keep]);
    out.extend_from_slice(&tokens[n_keep + erased_blocks * block_size..]);
    out
}

/// Length of the longest common prefix of two token sequences.
pub(crate) fn common_prefix(a: &[LlamaToken], b: &[LlamaToken]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Bind each `[img-<id>]` marker's preceding text to the matching image's
/// `prefix_prompt` and return the leftover tail text.
pub(crate) fn bind_image_prefixes(
    prompt: &str,
    images: &mut [SlotImage],
) -> Result<String, CoreError> {
    const PATTERN: &str = "[img-";

    let mut begin_prefix = 0;
    let mut cursor = 0;
    while let Some(found) = prompt[cursor..].find(PATTERN) {
        let end_prefix = cursor + found;
        let id_start = end_prefix + PATTERN.len();
        let Some(close) = prompt[id_start..].find(']') else {
            break;
        };
        let id_text = &prompt[id_start..id_start + close];
        let img_id: i32 = id_text
            .parse()
            .map_err(|_| CoreError::InvalidImage(format!("invalid image id \"{id_text}\"")))?;

        let image = images
            .iter_mut()
            .find(|img| img.id == img_id)
            .ok_or(CoreError::ImageNotFound(img_id))?;
        image.prefix_prompt = prompt[begin_prefix..end_prefix].to_string();
        begin_prefix = id_start + close + 1;
        cursor = begin_prefix;
    }

    Ok(prompt[begin_prefix..].to_string())
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use kiln_llama::mock::{MockEngine, MOCK_BOS, MOCK_MIDDLE, MOCK_PREFIX, MOCK_SUFFIX};

    #[test]
    fn text_prompt_gets_bos_when_requested() {
        let engine = MockEngine::new(64);
        let tokens = tokenize_prompt(&engine, &PromptInput::Text("ab".into()), true).unwrap();
        assert_eq!(tokens, vec![MOCK_BOS, b'a' as i32, b'b' as i32]);
        let tokens = tokenize_prompt(&engine, &PromptInput::Text("ab".into()), false).unwrap();
        assert_eq!(tokens, vec![b'a' as i32, b'b' as i32]);
    }

    #[test]
    fn segment_prompt_mixes_text_and_tokens() {
        let engine = MockEngine::new(64);
        let prompt = PromptInput::Segments(vec![
            PromptSegment::Text("a".into()),
            PromptSegment::Token(1000),
            PromptSegment::Text("b".into()),
        ]);
        let tokens = tokenize_prompt(&engine, &prompt, true).unwrap();
        assert_eq!(tokens, vec![MOCK_BOS, b'a' as i32, 1000, b'b' as i32]);
    }

    #[test]
    fn segment_prompt_starting_with_token_gets_no_bos() {
        let engine = MockEngine::new(64);
        let prompt = PromptInput::Segments(vec![
            PromptSegment::Token(1000),
            PromptSegment::Text("b".into()),
        ]);
        let tokens = tokenize_prompt(&engine, &prompt, true).unwrap();
        assert_eq!(tokens, vec![1000, b'b' as i32]);
    }

    #[test]
    fn infill_layout_and_delimiters() {
        let engine = MockEngine::new(64);
        let tokens = build_infill_prompt(&engine, "fn f", "}").unwrap();
        assert_eq!(tokens[0], MOCK_BOS);
        assert_eq!(tokens[1], MOCK_PREFIX);
        assert_eq!(tokens[2..6], [b'f' as i32, b'n' as i32, b' ' as i32, b'f' as i32]);
        assert_eq!(tokens[6], MOCK_SUFFIX);
        assert_eq!(tokens[7], b'}' as i32);
        assert_eq!(tokens[8], MOCK_MIDDLE);
    }

    #[test]
    fn infill_strips_leading_suffix_space() {
        let engine = MockEngine::new(64);
        let tokens = build_infill_prompt(&engine, "p", " return").unwrap();
        let suffix_at = tokens.iter().position(|&t| t == MOCK_SUFFIX).unwrap();
        assert_eq!(tokens[suffix_at + 1], b'r' as i32);
    }

    #[test]
    fn infill_drops_lone_space_token() {
        let engine = MockEngine::new(64);
        // a one-character " " suffix is handled via the token path
        let tokens = build_infill_prompt(&engine, "p", " ").unwrap();
        let suffix_at = tokens.iter().position(|&t| t == MOCK_SUFFIX).unwrap();
        assert_eq!(tokens[suffix_at + 1], MOCK_MIDDLE);
    }

    #[test]
    fn truncation_keeps_head_and_tail() {
        let tokens: Vec<i32> = (0..100).collect();
        let out = truncate_middle(&tokens, 8, 64);
        assert!(out.len() < 64);
        assert_eq!(&out[..8], &tokens[..8]);
        assert_eq!(out.last(), Some(&99));
        // exactly (n_ctx - n_keep) / 2 sized blocks were dropped
        let dropped = tokens.len() - out.len();
        assert_eq!(dropped % ((64 - 8) / 2), 0);
    }

    #[test]
    fn common_prefix_lengths() {
        assert_eq!(common_prefix(&[1, 2, 3], &[1, 2, 4]), 2);
        assert_eq!(common_prefix(&[1, 2], &[1, 2, 3]), 2);
        assert_eq!(common_prefix(&[], &[1]), 0);
    }

    #[test]
    fn image_markers_bind_prefixes_in_order() {
        let mut images = vec![
            SlotImage {
                id: 0,
                ..SlotImage::default()
            },
            SlotImage {
                id: 1,
                ..SlotImage::default()
            },
        ];
        let tail =
            bind_image_prefixes("system [img-0] user [img-1] describe", &mut images).unwrap();
        assert_eq!(images[0].prefix_prompt, "system ");
        assert_eq!(images[1].prefix_prompt, " user ");
        assert_eq!(tail, " describe");
    }

    #[test]
    fn unknown_image_id_is_an_error() {
        let mut images = vec![SlotImage {
            id: 0,
            ..SlotImage::default()
        }];
        let err = bind_image_prefixes("a [img-9] b", &mut images).unwrap_err();
        assert!(matches!(err, CoreError::ImageNotFound(9)));
    }
}
