use regex::RegexSet;

/// Returns the default sink-collision signatures as (pattern, reason) tuples.
/// The worker has no structured error channel, so these are matched against
/// its diagnostic text; they are heuristics, not a protocol.
pub fn default_collision_patterns() -> Vec<(String, String)> {
    vec![
        // nginx-rtmp / librtmp wording
        (r"(?i)already\s+publishing".into(), "Sink already has a publisher".into()),
        (r"NetStream\.Publish\.BadName".into(), "Sink name rejected as in use".into()),
        // Generic RTMP server wording
        (r"(?i)stream\s+(name\s+)?(is\s+)?already\s+in\s+use".into(), "Sink stream name in use".into()),
    ]
}

/// Classifies worker diagnostic text against a set of collision signatures.
pub struct DiagnosticClassifier {
    signatures: RegexSet,
    reasons: Vec<String>,
}

/// A matched collision signature.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CollisionMatch {
    pub reason: String,
}

impl DiagnosticClassifier {
    /// Compile `(pattern, reason)` signatures. `reasons` stays in pattern
    /// order so a set match index maps straight to its reason.
    pub fn new(signatures: &[(String, String)]) -> Result<Self, regex::Error> {
        let compiled = RegexSet::new(signatures.iter().map(|(pattern, _)| pattern))?;
        Ok(Self {
            signatures: compiled,
            reasons: signatures.iter().map(|(_, reason)| reason.clone()).collect(),
        })
    }

    /// Some(match) if the diagnostics say the sink is claimed by another publisher.
    pub fn collision(&self, diagnostics: &str) -> Option<CollisionMatch> {
        self.signatures
            .matches(diagnostics)
            .into_iter()
            .next()
            .map(|idx| CollisionMatch {
                reason: self.reasons[idx].clone(),
            })
    }
}

impl Default for DiagnosticClassifier {
    fn default() -> Self {
        // The built-in list is static and known to compile.
        Self::new(&default_collision_patterns()).unwrap_or_else(|_| Self {
            signatures: RegexSet::empty(),
            reasons: Vec::new(),
        })
    }
}
