//! Outreach e-mail composition: HTML body, proposal deck and calendar invite.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::types::{CallOutcome, StageResults};
use crate::capabilities::types::{Attachment, OutboundEmail};
use crate::leads::model::Lead;

const ICS_STAMP: &str = "%Y%m%dT%H%M%SZ";

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// ICS text values escape backslash, comma, semicolon and newlines.
fn escape_ics(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace(';', "\\;")
        .replace(',', "\\,")
        .replace('\n', "\\n")
}

/// A single-event `METHOD:REQUEST` calendar invite, CRLF-delimited.
pub fn generate_ics(
    business: &str,
    start: DateTime<Utc>,
    duration_minutes: i64,
    organizer: &str,
    attendee: &str,
) -> String {
    let end = start + Duration::minutes(duration_minutes);
    let description = format!("Follow-up on the website proposal for {business}.");
    let mut lines = vec![
        "BEGIN:VCALENDAR".to_string(),
        "VERSION:2.0".to_string(),
        "PRODID:-//RapidReach//SDR//EN".to_string(),
        "METHOD:REQUEST".to_string(),
        "BEGIN:VEVENT".to_string(),
        format!("UID:{}@rapidreach", Uuid::new_v4()),
        format!("DTSTAMP:{}", Utc::now().format(ICS_STAMP)),
        format!("DTSTART:{}", start.format(ICS_STAMP)),
        format!("DTEND:{}", end.format(ICS_STAMP)),
        "SUMMARY:RapidReach - Follow-up Meeting".to_string(),
        format!("DESCRIPTION:{}", escape_ics(&description)),
    ];
    if !organizer.is_empty() {
        lines.push(format!("ORGANIZER:mailto:{organizer}"));
    }
    lines.push(format!("ATTENDEE;RSVP=TRUE:mailto:{attendee}"));
    lines.extend(
        ["STATUS:CONFIRMED", "END:VEVENT", "END:VCALENDAR"]
            .into_iter()
            .map(String::from),
    );
    let mut ics = lines.join("\r\n");
    ics.push_str("\r\n");
    ics
}

fn opening_line(outcome: Option<CallOutcome>) -> &'static str {
    match outcome {
        Some(CallOutcome::Interested | CallOutcome::AgreedToEmail) => {
            "Thanks for taking the time to speak with us today. As promised, here is our proposal."
        }
        _ => "We help local businesses like yours win more customers online, and put together a short proposal for you.",
    }
}

/// Render the HTML body from the proposal and what the call produced.
pub fn html_body(lead: &Lead, results: &StageResults, sender_name: &str) -> String {
    let paragraphs: String = results
        .proposal
        .as_deref()
        .unwrap_or_default()
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>\n", escape_html(p).replace('\n', "<br>")))
        .collect();

    let meeting = results
        .proposed_meeting_time
        .map(|t| {
            format!(
                "<p>A calendar invite for our follow-up on {} UTC is attached.</p>\n",
                t.format("%A, %B %-d at %H:%M")
            )
        })
        .unwrap_or_default();

    let deck = if results.artifact.is_some() {
        "<p>The attached deck has the details.</p>\n"
    } else {
        ""
    };

    format!(
        "<html><body>\n<p>Hi {name} team,</p>\n<p>{opening}</p>\n{paragraphs}{deck}{meeting}<p>Best regards,<br>{sender}</p>\n</body></html>",
        name = escape_html(&lead.name),
        opening = opening_line(results.call_outcome),
        sender = escape_html(sender_name),
    )
}

/// Assemble the outreach e-mail. The deck bytes come from the run's artifact
/// (they are not persisted, so a rehydrated run sends without it).
pub fn compose(
    lead: &Lead,
    results: &StageResults,
    recipient: &str,
    sender_name: &str,
    organizer: &str,
    meeting_duration_minutes: i64,
) -> OutboundEmail {
    let mut attachments = Vec::new();
    if let Some(artifact) = &results.artifact
        && !artifact.data.is_empty()
    {
        attachments.push(Attachment {
            filename: artifact.filename.clone(),
            content_type: artifact.content_type.clone(),
            data: artifact.data.clone(),
        });
    }
    if let Some(start) = results.proposed_meeting_time {
        attachments.push(Attachment {
            filename: "invite.ics".to_string(),
            content_type: "text/calendar; method=REQUEST".to_string(),
            data: generate_ics(&lead.name, start, meeting_duration_minutes, organizer, recipient)
                .into_bytes(),
        });
    }

    OutboundEmail {
        to: recipient.to_string(),
        subject: format!("Website proposal for {}", lead.name),
        html_body: html_body(lead, results, sender_name),
        attachments,
    }
}
