//! OpenAI-compatible chat-completion client backing the text capabilities:
//! research, drafting, fact-checking and both classifiers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::types::*;
use crate::error::AdapterError;
use crate::leads::model::Lead;
use crate::pipeline::types::CallOutcome;

pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmClient {
    pub fn new(base_url: impl Into<String>, api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        }
    }

    /// One system + user turn; returns the assistant text.
    async fn complete(&self, capability: &str, system: &str, user: &str) -> AdapterResult<String> {
        let body = json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::transient(capability, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(capability, status, &text));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| AdapterError::semantic(capability, format!("bad response body: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(AdapterError::semantic(capability, "empty completion"));
        }
        debug!(capability, model = %self.model, chars = content.len(), "LLM completion");
        Ok(content)
    }
}

fn status_error(capability: &str, status: StatusCode, body: &str) -> AdapterError {
    let reason = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        AdapterError::transient(capability, reason)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        AdapterError::unavailable(capability, reason)
    } else {
        AdapterError::semantic(capability, reason)
    }
}

/// Extract a JSON object from model output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

fn describe(lead: &Lead) -> String {
    let mut lines = vec![format!("Business: {}", lead.name)];
    for (label, value) in [
        ("Category", &lead.category),
        ("Address", &lead.address),
        ("City", &lead.city),
        ("Phone", &lead.phone),
    ] {
        if !value.is_empty() {
            lines.push(format!("{label}: {value}"));
        }
    }
    if let Some(rating) = lead.rating {
        lines.push(format!("Rating: {rating:.1}"));
    }
    lines.push(format!("Has website: {}", lead.has_website));
    lines.join("\n")
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FactCheckResponse {
    #[serde(default)]
    accurate: bool,
    #[serde(default)]
    revised: String,
}

fn parse_fact_check(raw: &str, draft: &str) -> AdapterResult<FactCheck> {
    let resp: FactCheckResponse = serde_json::from_str(&extract_json_object(raw))
        .map_err(|e| AdapterError::semantic("fact_check", format!("JSON parse error: {e}")))?;
    if resp.accurate || resp.revised.trim().is_empty() {
        Ok(FactCheck {
            verdict: FactVerdict::Accurate,
            text: draft.to_string(),
        })
    } else {
        Ok(FactCheck {
            verdict: FactVerdict::Revised,
            text: resp.revised,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OutcomeResponse {
    outcome: String,
}

fn parse_outcome(raw: &str) -> Classified<CallOutcome> {
    serde_json::from_str::<OutcomeResponse>(&extract_json_object(raw))
        .ok()
        .and_then(|r| CallOutcome::from_label(&r.outcome))
        .map(Classified::parsed)
        .unwrap_or_else(|| Classified::unparseable(raw))
}

#[derive(Debug, Deserialize)]
struct ReplyResponse {
    intent: String,
    #[serde(default)]
    preferred_time: Option<String>,
}

fn parse_reply(raw: &str) -> Classified<ReplyIntent> {
    let Ok(resp) = serde_json::from_str::<ReplyResponse>(&extract_json_object(raw)) else {
        return Classified::unparseable(raw);
    };
    let preferred_time = resp
        .preferred_time
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc));
    let intent = match resp.intent.trim().to_ascii_lowercase().as_str() {
        "meeting_request" => ReplyIntent::MeetingRequest { preferred_time },
        "interested" => ReplyIntent::Interested,
        "not_interested" => ReplyIntent::NotInterested,
        "other" => ReplyIntent::Other,
        _ => return Classified::unparseable(raw),
    };
    Classified::parsed(intent)
}

// ── Capabilities ────────────────────────────────────────────────────

#[async_trait]
impl Research for LlmClient {
    async fn research(&self, lead: &Lead) -> AdapterResult<String> {
        self.complete(
            "research",
            "You research small local businesses for a web design agency. \
             Summarise in 3-5 sentences what the business does, its reputation, \
             and why a professional website would help it.",
            &describe(lead),
        )
        .await
    }
}

#[async_trait]
impl ProposalWriter for LlmClient {
    async fn draft_proposal(&self, lead: &Lead, research: &str) -> AdapterResult<String> {
        self.complete(
            "draft",
            "You write short, friendly website proposals for local businesses. \
             Use plain paragraphs, no markdown headings, under 200 words.",
            &format!("{}\n\nResearch:\n{research}", describe(lead)),
        )
        .await
    }

    async fn fact_check(&self, lead: &Lead, draft: &str) -> AdapterResult<FactCheck> {
        let raw = self
            .complete(
                "fact_check",
                "Check the proposal against the business facts. Return ONLY a JSON object: \
                 {\"accurate\": true/false, \"revised\": \"corrected proposal or empty\"}",
                &format!("{}\n\nProposal:\n{draft}", describe(lead)),
            )
            .await?;
        parse_fact_check(&raw, draft)
    }
}

#[async_trait]
impl OutcomeClassifier for LlmClient {
    async fn classify_outcome(&self, transcript: &str) -> AdapterResult<Classified<CallOutcome>> {
        let raw = self
            .complete(
                "classify_outcome",
                "Classify the outcome of this sales call. Return ONLY a JSON object: \
                 {\"outcome\": \"interested\" | \"agreed_to_email\" | \"not_interested\" | \"unknown\", \
                 \"confidence\": 0.0-1.0, \"key_points\": [], \"next_action\": \"\", \"summary\": \"\"}",
                transcript,
            )
            .await?;
        Ok(parse_outcome(&raw))
    }
}

#[async_trait]
impl ReplyClassifier for LlmClient {
    async fn classify_reply(&self, email: &InboundEmail) -> AdapterResult<Classified<ReplyIntent>> {
        let raw = self
            .complete(
                "classify_reply",
                "Classify this reply to a website proposal. A meeting request may be explicit \
                 (\"let's schedule a call\") or implicit (\"I'd love to learn more, when are you free\"). \
                 Return ONLY a JSON object: {\"intent\": \"meeting_request\" | \"interested\" | \
                 \"not_interested\" | \"other\", \"preferred_time\": RFC 3339 timestamp or null}",
                &format!(
                    "From: {}\nSubject: {}\n\n{}",
                    email.from, email.subject, email.body
                ),
            )
            .await?;
        Ok(parse_reply(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json() {
        let raw = "Sure!\n```json\n{\"outcome\": \"interested\"}\n```";
        assert_eq!(extract_json_object(raw), "{\"outcome\": \"interested\"}");
        assert_eq!(extract_json_object("x {\"a\":1} y"), "{\"a\":1}");
    }

    #[test]
    fn outcome_outside_known_set_is_unparseable() {
        assert_eq!(
            parse_outcome(r#"{"outcome": "agreed_to_email", "confidence": 0.9}"#),
            Classified::parsed(CallOutcome::AgreedToEmail)
        );
        assert!(matches!(
            parse_outcome(r#"{"outcome": "maybe later"}"#),
            Classified::Unparseable { .. }
        ));
        assert!(matches!(parse_outcome("no json here"), Classified::Unparseable { .. }));
    }

    #[test]
    fn reply_with_preferred_time() {
        let parsed = parse_reply(
            r#"{"intent": "meeting_request", "preferred_time": "2026-03-03T15:00:00Z"}"#,
        );
        match parsed {
            Classified::Parsed {
                value:
                    ReplyIntent::MeetingRequest {
                        preferred_time: Some(t),
                    },
            } => assert_eq!(t.to_rfc3339(), "2026-03-03T15:00:00+00:00"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            parse_reply(r#"{"intent": "interested"}"#),
            Classified::parsed(ReplyIntent::Interested)
        );
    }

    #[test]
    fn fact_check_revision() {
        let check = parse_fact_check(r#"{"accurate": false, "revised": "fixed"}"#, "draft").unwrap();
        assert_eq!(check.verdict, FactVerdict::Revised);
        assert_eq!(check.text, "fixed");
        let check = parse_fact_check(r#"{"accurate": true}"#, "draft").unwrap();
        assert_eq!(check.text, "draft");
        assert!(parse_fact_check("nope", "draft").is_err());
    }

    #[test]
    fn status_mapping() {
        assert!(status_error("x", StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(status_error("x", StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(matches!(
            status_error("x", StatusCode::UNAUTHORIZED, ""),
            AdapterError::Unavailable { .. }
        ));
        assert!(matches!(
            status_error("x", StatusCode::BAD_REQUEST, ""),
            AdapterError::Semantic { .. }
        ));
    }
}
