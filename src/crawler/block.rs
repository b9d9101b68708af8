use crate::browser::FetchOutcome;
use crate::cli::config::DetectionSettings;

/// How the detail stage should treat a fetch result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    /// Worth retrying: timeouts, navigation errors, 5xx, 429 with content
    Transient,
    /// Give up on this link, keep going with the others
    Fatal,
    /// Anti-bot wall, stop the run
    Blocked,
}

/// Anti-bot block heuristics
pub struct BlockClassifier {
    settings: DetectionSettings,
    markers: Vec<String>,
}

impl BlockClassifier {
    pub fn new(settings: DetectionSettings) -> Self {
        let markers = settings.markers.iter().map(|m| m.to_lowercase()).collect();
        Self { settings, markers }
    }

    fn has_marker(&self, text: &str, limit: Option<usize>) -> bool {
        let sample: String = match limit {
            Some(n) => text.chars().take(n).collect(),
            None => text.to_string(),
        };
        let sample = sample.to_lowercase();
        self.markers.iter().any(|m| sample.contains(m.as_str()))
    }

    /// Classify an HTTP status and response body
    pub fn classify(&self, status: Option<u16>, body: &str) -> Verdict {
        if self.has_marker(body, Some(self.settings.sample_chars)) {
            return Verdict::Blocked;
        }

        if let Some(code) = status {
            // A real page can come back with these codes; only tiny bodies are walls
            if self.settings.block_statuses.contains(&code)
                && body.trim().len() < self.settings.min_body_bytes
            {
                return Verdict::Blocked;
            }

            return match code {
                429 => Verdict::Transient,
                400..=499 => Verdict::Fatal,
                500..=599 => Verdict::Transient,
                _ => Verdict::Ok,
            };
        }

        Verdict::Ok
    }

    /// Classify a page fetch, including its title and error text
    pub fn classify_outcome(&self, outcome: &FetchOutcome) -> Verdict {
        let flagged = outcome.title.as_deref().map(|t| self.has_marker(t, None)).unwrap_or(false)
            || outcome.error.as_deref().map(|e| self.has_marker(e, None)).unwrap_or(false);
        if flagged {
            return Verdict::Blocked;
        }

        let verdict = self.classify(outcome.status_code(), &outcome.html);
        if verdict != Verdict::Ok {
            return verdict;
        }

        if !outcome.success {
            return Verdict::Transient;
        }

        if outcome.html.trim().is_empty() {
            return Verdict::Fatal;
        }

        Verdict::Ok
    }
}
