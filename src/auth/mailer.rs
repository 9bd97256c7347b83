//! Email delivery behind a narrow interface. Production wires a real
//! transport here; without SMTP configuration the logging mailer prints
//! the verification code, which is what dev and tests run on.

use crate::error::Result;

pub trait Mailer: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

/// Dev-mode mailer: the "mail" goes to the log.
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        tracing::info!(%to, %subject, %body, "email delivery is not configured; logging instead");
        Ok(())
    }
}
