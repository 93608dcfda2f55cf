use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_email: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("could not build message: {0}")]
    Message(#[from] lettre::error::Error),

    #[error("SMTP send failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("mail task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub fn build_message(settings: &SmtpSettings, to_email: &str, subject: &str, body: &str) -> Result<Message, MailError> {
    let from: Mailbox = settings.from_email.parse()?;
    let to: Mailbox = to_email.parse()?;

    Ok(Message::builder()
        .from(from)
        .to(to)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN)
        .body(body.to_string())?)
}

/// Sends a plain-text email. SMTP is blocking, so the send runs on the blocking pool.
pub async fn send_email(settings: &SmtpSettings, to_email: &str, subject: &str, body: &str) -> Result<(), MailError> {
    let email = build_message(settings, to_email, subject, body)?;

    let creds = Credentials::new(settings.username.clone(), settings.password.clone());
    let mailer = SmtpTransport::relay(&settings.host)?
        .port(settings.port)
        .credentials(creds)
        .build();

    let recipient = to_email.to_string();
    let result = tokio::task::spawn_blocking(move || mailer.send(&email)).await?;
    match result {
        Ok(_) => {
            info!("Email sent successfully via SMTP to {}", recipient);
            Ok(())
        }
        Err(e) => {
            error!("SMTP send failed: {}", e);
            Err(MailError::Smtp(e))
        }
    }
}
