use std::sync::OnceLock;

use regex::Regex;

struct Patterns {
    cue_lines: Regex,
    bracketed_cues: Regex,
    bracketed_timestamps: Regex,
    timestamp_ranges: Regex,
    bare_timestamps: Regex,
    spaces: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        cue_lines: Regex::new(r"(?im)^\s*(?:sfx|sound(?:\s+effects?)?|music|bgm)\s*:.*$")
            .expect("cue line pattern"),
        bracketed_cues: Regex::new(
            r"(?i)[\[(]\s*(?:sfx|sound(?:\s+effects?)?|music|bgm)\b[^\])]*[\])]",
        )
        .expect("bracketed cue pattern"),
        bracketed_timestamps: Regex::new(
            r"[\[(]\s*\d{1,2}:\d{2}(?::\d{2})?(?:\s*[-–]\s*\d{1,2}:\d{2}(?::\d{2})?)?\s*[\])]",
        )
        .expect("bracketed timestamp pattern"),
        timestamp_ranges: Regex::new(
            r"\b\d{1,2}:\d{2}(?::\d{2})?\s*[-–]\s*\d{1,2}:\d{2}(?::\d{2})?\b",
        )
        .expect("timestamp range pattern"),
        bare_timestamps: Regex::new(r"\b\d{1,2}:\d{2}:\d{2}\b").expect("timestamp pattern"),
        spaces: Regex::new(r"[ \t]{2,}").expect("space pattern"),
    })
}

/// Strips script noise that confuses an image model: timestamps, sound
/// cues and music cues. Plain clock times ("at 9:30") are kept.
pub fn clean_narrative(text: &str) -> String {
    let p = patterns();
    let text = p.cue_lines.replace_all(text, "");
    let text = p.bracketed_cues.replace_all(&text, "");
    let text = p.bracketed_timestamps.replace_all(&text, "");
    let text = p.timestamp_ranges.replace_all(&text, "");
    let text = p.bare_timestamps.replace_all(&text, "");
    let text = p.spaces.replace_all(&text, " ");
    text.lines()
        .map(str::trim)
        .map(|line| line.trim_start_matches(['-', ':', '–']).trim_start())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Keeps the last `max_chars` characters, cutting on a char boundary.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let skip = total - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}
