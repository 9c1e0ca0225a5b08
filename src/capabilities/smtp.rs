//! Outreach e-mail over SMTP via lettre.

use async_trait::async_trait;
use chrono::Utc;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MailAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::info;
use uuid::Uuid;

use super::types::{AdapterResult, DeliveryReceipt, EmailSender, OutboundEmail};
use crate::config::SmtpConfig;
use crate::error::AdapterError;

pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn transport(&self) -> AdapterResult<SmtpTransport> {
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );
        let builder = if self.config.port == 465 {
            SmtpTransport::relay(&self.config.host)
        } else {
            SmtpTransport::starttls_relay(&self.config.host)
        }
        .map_err(|e| AdapterError::unavailable("email", format!("SMTP relay error: {e}")))?;
        Ok(builder.port(self.config.port).credentials(creds).build())
    }
}

fn parse_mailbox(raw: &str, what: &str) -> AdapterResult<Mailbox> {
    raw.parse()
        .map_err(|e| AdapterError::semantic("email", format!("Invalid {what} address {raw:?}: {e}")))
}

/// Build the MIME message: HTML body plus one part per attachment.
fn build_message(from: &str, email: &OutboundEmail, message_id: &str) -> AdapterResult<Message> {
    let mut body = MultiPart::mixed().singlepart(SinglePart::html(email.html_body.clone()));
    for attachment in &email.attachments {
        let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
            AdapterError::semantic(
                "email",
                format!("Invalid content type {:?}: {e}", attachment.content_type),
            )
        })?;
        body = body.singlepart(
            MailAttachment::new(attachment.filename.clone())
                .body(attachment.data.clone(), content_type),
        );
    }

    Message::builder()
        .from(parse_mailbox(from, "from")?)
        .to(parse_mailbox(&email.to, "to")?)
        .subject(email.subject.clone())
        .message_id(Some(message_id.to_string()))
        .multipart(body)
        .map_err(|e| AdapterError::semantic("email", format!("Failed to build email: {e}")))
}

#[async_trait]
impl EmailSender for SmtpMailer {
    async fn send_email(&self, email: &OutboundEmail) -> AdapterResult<DeliveryReceipt> {
        let message_id = format!("<{}@rapidreach>", Uuid::new_v4());
        let message = build_message(&self.config.from_address, email, &message_id)?;
        let transport = self.transport()?;

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| AdapterError::transient("email", format!("send task failed: {e}")))?
            .map_err(|e| {
                if e.is_permanent() {
                    AdapterError::semantic("email", format!("SMTP rejected message: {e}"))
                } else {
                    AdapterError::transient("email", format!("SMTP send failed: {e}"))
                }
            })?;

        info!(to = %email.to, attachments = email.attachments.len(), "Email sent");
        Ok(DeliveryReceipt {
            message_id,
            recipient: email.to.clone(),
            sent_at: Utc::now(),
        })
    }
}
