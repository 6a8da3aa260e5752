/// Body positions that image models tend to ignore unless stated up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseDirective {
    LyingFaceDown,
    LyingFaceUp,
    HandsCuffed,
    Kneeling,
    HandsRaised,
    Seated,
    BackToCamera,
    Running,
}

impl PoseDirective {
    pub fn instruction(self) -> &'static str {
        match self {
            Self::LyingFaceDown => {
                "Subject lies flat on the ground FACE DOWN, chest and face toward the floor, back of the head visible."
            }
            Self::LyingFaceUp => "Subject lies flat on their back FACE UP, looking at the sky or ceiling.",
            Self::HandsCuffed => "Subject's wrists are handcuffed together; the cuffs must be clearly visible.",
            Self::Kneeling => "Subject is kneeling with both knees on the ground.",
            Self::HandsRaised => "Subject holds both hands raised above the head.",
            Self::Seated => "Subject is seated, not standing.",
            Self::BackToCamera => "Subject has their back to the camera; the face is not visible.",
            Self::Running => "Subject is mid-stride in a full run, body leaning forward.",
        }
    }
}

/// Finds physical-state directives in scene text.
pub trait PoseExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Vec<PoseDirective>;
}

const POSE_RULES: &[(PoseDirective, &[&str])] = &[
    (
        PoseDirective::LyingFaceDown,
        &["face down", "face-down", "facedown", "prone", "nằm sấp", "úp mặt"],
    ),
    (
        PoseDirective::LyingFaceUp,
        &["face up", "face-up", "lying on his back", "lying on her back", "supine", "nằm ngửa"],
    ),
    (PoseDirective::HandsCuffed, &["handcuff", "cuffed", "còng tay"]),
    (PoseDirective::Kneeling, &["kneel", "on his knees", "on her knees", "quỳ"]),
    (
        PoseDirective::HandsRaised,
        &["hands up", "hands raised", "raises his hands", "raises her hands", "giơ tay"],
    ),
    (PoseDirective::Seated, &["sitting", "seated", "sits ", "ngồi"]),
    (
        PoseDirective::BackToCamera,
        &["back to camera", "back to the camera", "from behind", "quay lưng"],
    ),
    (PoseDirective::Running, &["running", "sprinting", "runs ", "chạy"]),
];

/// Keyword table matched case-insensitively, in table order.
pub struct KeywordPoseExtractor {
    rules: &'static [(PoseDirective, &'static [&'static str])],
}

impl Default for KeywordPoseExtractor {
    fn default() -> Self {
        Self { rules: POSE_RULES }
    }
}

impl PoseExtractor for KeywordPoseExtractor {
    fn extract(&self, text: &str) -> Vec<PoseDirective> {
        let lowered = text.to_lowercase();
        let mut found: Vec<PoseDirective> = Vec::new();
        for (directive, keywords) in self.rules {
            if keywords.iter().any(|keyword| lowered.contains(keyword)) {
                found.push(*directive);
            }
        }
        if found.contains(&PoseDirective::LyingFaceDown) {
            found.retain(|directive| *directive != PoseDirective::LyingFaceUp);
        }
        found
    }
}
