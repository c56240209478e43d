use anyhow::Context;
use async_trait::async_trait;
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::info;

use crate::config::MailConfig;

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Delivers a plaintext verification code to `to`.
    async fn send_otp(&self, to: &str, code: &str, valid_for_minutes: u64) -> anyhow::Result<()>;
}

/// SMTP mailer; in production this points at the SendGrid relay.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(cfg: &MailConfig) -> anyhow::Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.smtp_host)
            .context("smtp relay")?
            .port(cfg.smtp_port)
            .credentials(Credentials::new(
                cfg.smtp_username.clone(),
                cfg.api_key.clone(),
            ))
            .build();

        let from = format!("Uplify <{}>", cfg.sender_email)
            .parse::<Mailbox>()
            .context("SENDGRID_SENDER_EMAIL is not a valid address")?;

        Ok(Self { transport, from })
    }
}

pub(crate) fn otp_bodies(code: &str, valid_for_minutes: u64) -> (String, String) {
    let plain = format!(
        "Your Uplify verification code is {code}.\n\
         It expires in {valid_for_minutes} minutes. If you did not request it, ignore this email."
    );
    let html = format!(
        r#"<p>Your Uplify verification code is</p>
<p style="font-size:24px;font-weight:bold;letter-spacing:4px">{code}</p>
<p>It expires in {valid_for_minutes} minutes. If you did not request it, ignore this email.</p>"#
    );
    (plain, html)
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_otp(&self, to: &str, code: &str, valid_for_minutes: u64) -> anyhow::Result<()> {
        let to_box = to.parse::<Mailbox>().context("recipient address")?;
        let (plain, html) = otp_bodies(code, valid_for_minutes);

        let message = Message::builder()
            .from(self.from.clone())
            .to(to_box)
            .subject("Your Uplify verification code")
            .multipart(MultiPart::alternative_plain_html(plain, html))
            .context("build otp email")?;

        self.transport
            .send(message)
            .await
            .context("smtp send")?;
        info!(to = %to, "otp email sent");
        Ok(())
    }
}
