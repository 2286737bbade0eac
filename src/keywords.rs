//! Message text normalization and keyword fingerprints.
//!
//! Raw messages carry inline platform codes such as `[CQ:image,file=..]` or
//! `[CQ:at,qq=..]`. Mentions and reply markers are dropped, any other code
//! marks the message as media, which keeps it out of the learned index.

use std::collections::HashMap;

/// Texts up to this many characters are their own fingerprint.
pub const SHORT_TEXT_CHARS: usize = 8;

const SILENT_SEGMENTS: &[&str] = &["at", "reply"];

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "do", "for", "if", "in", "is", "it",
    "me", "my", "no", "not", "of", "on", "or", "so", "that", "the", "this", "to", "up", "was",
    "we", "what", "you",
];

const STOP_CHARS: &[char] = &[
    '的', '了', '吗', '呢', '啊', '吧', '是', '我', '你', '他', '她', '它', '这', '那', '就', '都',
    '也', '还', '在', '有', '和', '嘛', '呀', '哦', '么',
];

/// Text extracted from a raw message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub plain_text: String,
    /// False when the message carried media segments.
    pub is_plain_text: bool,
}

/// Strips inline codes and collapses whitespace.
///
/// Returns `None` when nothing is left to look at: whitespace only, or
/// mentions only.
pub fn normalize(raw: &str) -> Option<Normalized> {
    let mut text = String::with_capacity(raw.len());
    let mut has_media = false;
    let mut rest = raw;

    while let Some(start) = rest.find("[CQ:") {
        text.push_str(&rest[..start]);
        let after = &rest[start + 4..];
        let Some(end) = after.find(']') else {
            // Unterminated code, keep it as literal text.
            text.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let segment = &after[..end];
        let kind = segment.split(',').next().unwrap_or_default();
        if !SILENT_SEGMENTS.contains(&kind) {
            has_media = true;
        }
        text.push(' ');
        rest = &after[end + 1..];
    }
    text.push_str(rest);

    let plain_text = collapse_whitespace(&unescape(&text));
    if plain_text.is_empty() && !has_media {
        return None;
    }

    Some(Normalized {
        plain_text,
        is_plain_text: !has_media,
    })
}

/// Derives the index key for a plain text.
///
/// Deterministic and pure. Short texts key on themselves; longer ones on their
/// `keyword_limit` most frequent tokens, sorted.
pub fn fingerprint(plain_text: &str, keyword_limit: usize) -> Option<String> {
    let collapsed = collapse_whitespace(plain_text).to_lowercase();
    if collapsed.is_empty() {
        return None;
    }
    if collapsed.chars().count() <= SHORT_TEXT_CHARS || keyword_limit == 0 {
        return Some(collapsed);
    }

    let tokens = tokenize(&collapsed);
    if tokens.is_empty() {
        return Some(collapsed);
    }

    let mut ranked: HashMap<&str, (usize, usize)> = HashMap::new();
    for (pos, token) in tokens.iter().enumerate() {
        ranked.entry(token.as_str()).or_insert((0, pos)).0 += 1;
    }
    let mut ranked: Vec<(&str, usize, usize)> =
        ranked.into_iter().map(|(t, (count, pos))| (t, count, pos)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

    let mut picked: Vec<&str> = ranked.into_iter().take(keyword_limit).map(|(t, ..)| t).collect();
    picked.sort_unstable();
    Some(picked.join(" "))
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut run: Vec<char> = Vec::new();

    for ch in text.chars() {
        if is_cjk(ch) {
            flush_word(&mut word, &mut tokens);
            run.push(ch);
        } else if ch.is_alphanumeric() {
            flush_run(&mut run, &mut tokens);
            word.push(ch);
        } else {
            flush_word(&mut word, &mut tokens);
            flush_run(&mut run, &mut tokens);
        }
    }
    flush_word(&mut word, &mut tokens);
    flush_run(&mut run, &mut tokens);
    tokens
}

fn flush_word(word: &mut String, tokens: &mut Vec<String>) {
    if word.chars().count() >= 2 && !STOP_WORDS.contains(&word.as_str()) {
        tokens.push(word.clone());
    }
    word.clear();
}

fn flush_run(run: &mut Vec<char>, tokens: &mut Vec<String>) {
    for pair in run.windows(2) {
        if STOP_CHARS.contains(&pair[0]) && STOP_CHARS.contains(&pair[1]) {
            continue;
        }
        tokens.push(pair.iter().collect());
    }
    run.clear();
}

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x3040..=0x30FF     // kana
        | 0x3400..=0x4DBF
        | 0x4E00..=0x9FFF
        | 0xAC00..=0xD7AF   // hangul
        | 0xF900..=0xFAFF)
}

fn unescape(text: &str) -> String {
    text.replace("&#91;", "[")
        .replace("&#93;", "]")
        .replace("&#44;", ",")
        .replace("&amp;", "&")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
