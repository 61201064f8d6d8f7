use crate::registry::DEFAULT_BACKEND;

/// Ordered backend names a single call will try.
///
/// The requested names are deduplicated (first occurrence wins), `default` is
/// appended when missing, and the resulting list is repeated once so every
/// candidate gets a second pass after all others were tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptPlan {
    names: Vec<String>,
}

impl AttemptPlan {
    /// Plans the given preferred names.
    pub fn new<S: AsRef<str>>(requested: &[S]) -> Self {
        let mut pass: Vec<String> = Vec::with_capacity(requested.len() + 1);
        for name in requested {
            let name = name.as_ref();
            if !pass.iter().any(|n| n == name) {
                pass.push(name.to_string());
            }
        }
        if !pass.iter().any(|n| n == DEFAULT_BACKEND) {
            pass.push(DEFAULT_BACKEND.to_string());
        }

        let mut names = Vec::with_capacity(pass.len() * 2);
        names.extend(pass.iter().cloned());
        names.extend(pass);
        Self { names }
    }

    /// Names in attempt order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Total number of attempts.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Never true, since `default` is always planned.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Names in attempt order, as a slice.
    pub fn as_slice(&self) -> &[String] {
        &self.names
    }
}
