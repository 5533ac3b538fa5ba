//! Shared-token authorization for privileged control operations.

/// Holder of the control token. With no token configured every privileged
/// request is refused.
#[derive(Debug, Clone, Default)]
pub struct ControlAuth {
    token: Option<String>,
}

impl ControlAuth {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    /// Constant-time comparison against the configured token.
    pub fn authorize(&self, presented: &str) -> bool {
        let Some(expected) = self.token.as_deref() else {
            return false;
        };
        let (a, b) = (expected.as_bytes(), presented.as_bytes());
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}
