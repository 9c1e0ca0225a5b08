//! Call transcript mining: e-mail addresses and proposed follow-up times.
//!
//! Phone transcripts spell addresses out ("joe at joescafe dot com",
//! "t m zero seven march at gmail dot com"), so several patterns run with
//! descending confidence and the results are ranked best-first.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use regex::Regex;

const NUMBER_WORDS: &[(&str, &str)] = &[
    ("seventeen", "17"),
    ("thirteen", "13"),
    ("fourteen", "14"),
    ("eighteen", "18"),
    ("nineteen", "19"),
    ("fifteen", "15"),
    ("sixteen", "16"),
    ("seventy", "70"),
    ("twelve", "12"),
    ("eleven", "11"),
    ("twenty", "20"),
    ("thirty", "30"),
    ("eighty", "80"),
    ("ninety", "90"),
    ("seven", "7"),
    ("three", "3"),
    ("eight", "8"),
    ("forty", "40"),
    ("fifty", "50"),
    ("sixty", "60"),
    ("zero", "0"),
    ("four", "4"),
    ("five", "5"),
    ("nine", "9"),
    ("one", "1"),
    ("two", "2"),
    ("six", "6"),
    ("ten", "10"),
    ("oh", "0"),
];

/// Words that look like a username in "<word> at <domain>" but never are.
const NOT_USERNAMES: &[&str] = &[
    "monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday", "call",
    "look", "looking", "reach", "meet", "available", "scheduled", "appointment", "meeting",
    "time", "address", "number", "phone", "business", "interested", "discussed", "contact",
    "invitation", "information", "provide", "discuss", "touch", "email", "your", "that",
    "this", "with", "from", "have", "been", "is", "it", "in", "on", "to", "of", "or", "an",
    "the", "and", "for", "but", "not", "are", "was", "has", "had", "his", "her", "our",
    "can", "you", "all", "its", "me", "my",
];

/// Filler words dropped from the front of a spelled-out username.
const LEADING_FILLER: &[&str] = &[
    "your", "my", "is", "email", "address", "it", "its", "it's", "that's", "thats", "the", "a",
];

static LITERAL_EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid regex")
});

static SPOKEN_AT_DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([A-Za-z0-9._%+-]{2,})\s+at\s+([A-Za-z0-9]+\.[A-Za-z]{2,})\b")
        .expect("valid regex")
});

static SPOKEN_AT_DOT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([A-Za-z0-9._%+-]{2,})\s+at\s+([A-Za-z0-9]+)\s+dot\s+([A-Za-z]{2,})\b")
        .expect("valid regex")
});

static SPELLED_AT_DOT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b({tok}(?:\s+{tok})+)\s+at\s+([A-Za-z0-9]+)\s+dot\s+([A-Za-z]{{2,}})\b",
        tok = spelled_token()
    ))
    .expect("valid regex")
});

static MEETING_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(monday|tuesday|wednesday|thursday|friday|saturday|sunday)\s+(?:at\s+)?(\d{1,2}|one|two|three|four|five|six|seven|eight|nine|ten|eleven|twelve)(?::(\d{2}))?\s*(a\.?m\.?|p\.?m\.?|am|pm)?",
    )
    .expect("valid regex")
});

fn spelled_token() -> String {
    let words: Vec<&str> = NUMBER_WORDS.iter().map(|(w, _)| *w).collect();
    format!(r"(?:{}|\d+|[A-Za-z]{{1,6}})", words.join("|"))
}

fn is_username(word: &str) -> bool {
    let lower = word.to_lowercase();
    !NOT_USERNAMES.contains(&lower.as_str()) && !NUMBER_WORDS.iter().any(|(w, _)| *w == lower)
}

/// Collapse a spelled-out username ("t m zero seven march") to "tm07march".
fn collapse_spelled(raw: &str) -> Option<String> {
    let mut tokens: Vec<&str> = raw.split_whitespace().collect();
    while tokens
        .first()
        .is_some_and(|t| LEADING_FILLER.contains(&t.to_lowercase().as_str()))
    {
        tokens.remove(0);
    }
    let collapsed: String = tokens
        .iter()
        .map(|t| {
            let lower = t.to_lowercase();
            NUMBER_WORDS
                .iter()
                .find(|(w, _)| *w == lower)
                .map(|(_, d)| d.to_string())
                .unwrap_or(lower)
        })
        .collect();
    (collapsed.len() >= 3).then_some(collapsed)
}

/// Extract e-mail addresses from a transcript, best match first, lowercased
/// and de-duplicated.
pub fn extract_emails(text: &str) -> Vec<String> {
    let mut candidates: Vec<(u8, String)> = Vec::new();

    for m in LITERAL_EMAIL.find_iter(text) {
        candidates.push((100, m.as_str().to_string()));
    }
    for caps in SPOKEN_AT_DOMAIN.captures_iter(text) {
        if is_username(&caps[1]) {
            candidates.push((90, format!("{}@{}", &caps[1], &caps[2])));
        }
    }
    for caps in SPOKEN_AT_DOT.captures_iter(text) {
        if is_username(&caps[1]) {
            candidates.push((85, format!("{}@{}.{}", &caps[1], &caps[2], &caps[3])));
        }
    }
    for caps in SPELLED_AT_DOT.captures_iter(text) {
        if let Some(user) = collapse_spelled(&caps[1]) {
            candidates.push((80, format!("{user}@{}.{}", &caps[2], &caps[3])));
        }
    }

    // Stable sort keeps transcript order within a priority.
    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .map(|(_, email)| email.to_lowercase().trim_matches('.').to_string())
        .filter(|email| seen.insert(email.clone()))
        .collect()
}

/// Next occurrence of `day` strictly after `after`'s date.
fn next_weekday(day: Weekday, after: DateTime<Utc>) -> DateTime<Utc> {
    let current = after.weekday().num_days_from_monday() as i64;
    let target = day.num_days_from_monday() as i64;
    let mut ahead = target - current;
    if ahead <= 0 {
        ahead += 7;
    }
    after + Duration::days(ahead)
}

fn at_time(day: DateTime<Utc>, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    Utc.from_local_datetime(&day.date_naive().and_time(time)).single()
}

fn parse_hour(raw: &str) -> Option<u32> {
    let words = [
        "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten", "eleven",
        "twelve",
    ];
    let lower = raw.to_lowercase();
    match words.iter().position(|w| *w == lower) {
        Some(i) => Some(i as u32 + 1),
        None => lower.parse().ok(),
    }
}

/// Find a "weekday at time" mention ("Wednesday at 11", "friday 2 p.m.").
///
/// Bare hours 1-7 are read as afternoon.
pub fn find_meeting_time(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let caps = MEETING_TIME.captures(text)?;
    let day: Weekday = caps[1].to_lowercase().parse().ok()?;
    let mut hour = parse_hour(&caps[2])?;
    let minute: u32 = match caps.get(3) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    let meridiem = caps
        .get(4)
        .map(|m| m.as_str().replace('.', "").to_lowercase())
        .unwrap_or_default();

    match meridiem.as_str() {
        "pm" if hour < 12 => hour += 12,
        "am" if hour == 12 => hour = 0,
        "" if (1..=7).contains(&hour) => hour += 12,
        _ => {}
    }
    at_time(next_weekday(day, now), hour, minute)
}

/// Proposed follow-up time from a transcript, defaulting to next Wednesday 11:00.
pub fn extract_meeting_time(text: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    find_meeting_time(text, now)
        .or_else(|| at_time(next_weekday(Weekday::Wed, now), 11, 0))
        .unwrap_or(now + Duration::days(7))
}
