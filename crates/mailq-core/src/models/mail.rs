use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::AppError;
use crate::models::NewMailTask;

/// Intake payload, accepted as `<mail><to/><subject/><body/></mail>` or the
/// equivalent JSON object. Absent fields decode as empty strings so that
/// validation can report every missing field at once.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename = "mail")]
pub struct MailRequest {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

impl MailRequest {
    /// Check required fields and turn the request into task content.
    pub fn validate(self) -> Result<NewMailTask, AppError> {
        let missing: Vec<&str> = [
            ("to", &self.to),
            ("subject", &self.subject),
            ("body", &self.body),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if !missing.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "Missing required fields: {}",
                missing.join(", ")
            )));
        }

        Ok(NewMailTask {
            recipient: self.to.trim().to_string(),
            subject: self.subject,
            body: self.body,
        })
    }
}
