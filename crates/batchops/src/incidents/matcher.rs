//! Known-error matching
//!
//! Failure messages are tested against the active rule library in
//! (created_at, id) order; the first match wins. Patterns are regexes
//! applied as case-insensitive substring searches against the raw
//! message. A broken pattern in the library is skipped, never fatal.

use regex::RegexBuilder;
use std::sync::Arc;
use tracing::warn;

use crate::errors::RepositoryResult;
use crate::models::KnownError;
use crate::repositories::KnownErrorRepo;

pub struct KnownErrorMatcher {
    known_errors: Arc<dyn KnownErrorRepo>,
}

impl KnownErrorMatcher {
    pub fn new(known_errors: Arc<dyn KnownErrorRepo>) -> Self {
        Self { known_errors }
    }

    /// The earliest-created active rule whose pattern matches `message`
    pub async fn match_message(&self, message: &str) -> RepositoryResult<Option<KnownError>> {
        for rule in self.known_errors.list_active().await? {
            let regex = match RegexBuilder::new(&rule.pattern)
                .case_insensitive(true)
                .build()
            {
                Ok(regex) => regex,
                Err(e) => {
                    warn!("Skipping known error '{}' with bad pattern: {}", rule.name, e);
                    continue;
                }
            };
            if regex.is_match(message) {
                return Ok(Some(rule));
            }
        }
        Ok(None)
    }
}
