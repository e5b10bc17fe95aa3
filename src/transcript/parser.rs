//! Parser für `[MM:SS] Text` Transkripte

use serde::{Deserialize, Serialize};

/// Geschätzte Sprechdauer pro Zeichen (Sekunden)
const SECONDS_PER_CHAR: f64 = 0.06;

/// Mindestanzeigedauer (Sekunden)
const MIN_DURATION: f64 = 2.0;

/// Eine Untertitelzeile mit Start- und Endzeit in Sekunden
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionSegment {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

impl CaptionSegment {
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time <= self.end
    }
}

/// Liest alle Zeilen mit Zeitstempel; andere Zeilen werden ignoriert
///
/// Die Endzeit ist geschätzt: Start + Textlänge * 0.06s + 2s. Die Textlänge
/// zählt UTF-16 Code Units, wie sie ein Browser-Player meldet.
pub fn parse_transcript(transcript: &str) -> Vec<CaptionSegment> {
    transcript
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> Option<CaptionSegment> {
    // Der Zeitstempel darf irgendwo in der Zeile stehen
    let (offset, minutes, seconds) = line
        .match_indices('[')
        .find_map(|(idx, _)| parse_timestamp(&line[idx..]).map(|(m, s)| (idx, m, s)))?;

    let text = line[offset + "[MM:SS]".len()..].trim().to_string();
    let start = f64::from(minutes * 60 + seconds);
    let end = start + text.encode_utf16().count() as f64 * SECONDS_PER_CHAR + MIN_DURATION;

    Some(CaptionSegment { text, start, end })
}

/// `[MM:SS]` am Anfang von `s`
fn parse_timestamp(s: &str) -> Option<(u32, u32)> {
    let bytes = s.as_bytes();
    if bytes.len() < 7 || bytes[0] != b'[' || bytes[3] != b':' || bytes[6] != b']' {
        return None;
    }
    let digits = |range: std::ops::Range<usize>| -> Option<u32> {
        let part = &bytes[range];
        if !part.iter().all(u8::is_ascii_digit) {
            return None;
        }
        Some(part.iter().fold(0, |acc, d| acc * 10 + u32::from(d - b'0')))
    };
    Some((digits(1..3)?, digits(4..6)?))
}
