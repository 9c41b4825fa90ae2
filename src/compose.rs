//! Prompt construction and post-processing of generated text.

use crate::llm::CompletionRequest;

pub const DEFAULT_STYLE: &str = "informative";
pub const DEFAULT_LENGTH: u32 = 1500;
const SUMMARY_MAX_CHARS: usize = 120;

const SYSTEM_PROMPT: &str = "You are an experienced editor writing articles for Chinese self-media platforms \
(WeChat Official Accounts, Zhihu, Toutiao). Write in the language of the topic. \
Never add commentary about yourself or the request.";

pub fn title_request(model: &str, topic: &str, style: &str) -> CompletionRequest {
    CompletionRequest {
        model: model.to_string(),
        system: Some(SYSTEM_PROMPT.to_string()),
        prompt: format!(
            "Write one headline for an article about the topic below.\n\
             Style: {style}\n\
             Reply with the headline only, on a single line, without quotes.\n\n\
             Topic: {topic}"
        ),
        max_tokens: Some(64),
    }
}

pub fn titles_request(model: &str, topic: &str, count: usize) -> CompletionRequest {
    CompletionRequest {
        model: model.to_string(),
        system: Some(SYSTEM_PROMPT.to_string()),
        prompt: format!(
            "Suggest {count} different headlines for an article about the topic below.\n\
             Reply with one headline per line and nothing else.\n\n\
             Topic: {topic}"
        ),
        max_tokens: Some(64 * count.max(1) as u32),
    }
}

pub fn content_request(model: &str, topic: &str, title: &str, style: &str, length: u32) -> CompletionRequest {
    CompletionRequest {
        model: model.to_string(),
        system: Some(SYSTEM_PROMPT.to_string()),
        prompt: format!(
            "Write the body of an article.\n\
             Title: {title}\n\
             Topic: {topic}\n\
             Style: {style}\n\
             Target length: about {length} characters.\n\
             Use short paragraphs separated by blank lines. Do not repeat the title."
        ),
        max_tokens: Some(length.saturating_mul(2).max(256)),
    }
}

/// Reduce a model reply to a single headline.
pub fn clean_title(raw: &str) -> String {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
    let line = line.trim_start_matches('#').trim_start();
    let line = strip_numbering(line);
    let line = line
        .strip_prefix("Title:")
        .or_else(|| line.strip_prefix("标题："))
        .or_else(|| line.strip_prefix("标题:"))
        .unwrap_or(line)
        .trim();
    line.trim_matches(|c| matches!(c, '"' | '\'' | '“' | '”' | '《' | '》' | '「' | '」' | '*'))
        .trim()
        .to_string()
}

/// Parse a list of headlines, one per line, dropping blanks and duplicates.
pub fn parse_titles(raw: &str, count: usize) -> Vec<String> {
    let mut titles: Vec<String> = Vec::new();
    for line in raw.lines() {
        let title = clean_title(line);
        if title.is_empty() || titles.contains(&title) {
            continue;
        }
        titles.push(title);
        if titles.len() == count {
            break;
        }
    }
    titles
}

fn strip_numbering(line: &str) -> &str {
    let rest = line.trim_start_matches(|c: char| c.is_ascii_digit());
    if rest.len() == line.len() {
        return line.trim_start_matches(['-', '•', '*']).trim_start();
    }
    match rest.strip_prefix(['.', ')', '、', '．']) {
        Some(rest) => rest.trim_start(),
        None => line,
    }
}

/// First non-empty paragraph, capped at 120 characters.
pub fn summarize(content: &str) -> String {
    let paragraph = content
        .split("\n\n")
        .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
        .find(|p| !p.is_empty())
        .unwrap_or_default();
    if paragraph.chars().count() <= SUMMARY_MAX_CHARS {
        return paragraph;
    }
    let mut summary: String = paragraph.chars().take(SUMMARY_MAX_CHARS - 1).collect();
    summary.push('…');
    summary
}

/// Each CJK ideograph counts as one word; other text is split on whitespace.
pub fn word_count(content: &str) -> usize {
    let mut count = 0;
    let mut in_word = false;
    for c in content.chars() {
        if is_cjk(c) {
            count += 1;
            in_word = false;
        } else if c.is_whitespace() || is_cjk_punctuation(c) {
            in_word = false;
        } else if !in_word {
            count += 1;
            in_word = true;
        }
    }
    count
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{20000}'..='\u{2A6DF}')
}

fn is_cjk_punctuation(c: char) -> bool {
    matches!(c, '\u{3000}'..='\u{303F}' | '\u{FF00}'..='\u{FFEF}')
}
