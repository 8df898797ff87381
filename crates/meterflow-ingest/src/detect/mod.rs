//! File type detection
//!
//! [`TypeDetector`] runs an ordered chain of [`Classifier`]s over a file's
//! name and its first [`DETECTION_HEAD_BYTES`] bytes. The first verdict whose
//! confidence clears the threshold wins. New formats are supported by adding a
//! classifier to the chain; existing classifiers never change.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

pub mod classifiers;
pub mod encoding;

pub use encoding::{decode_auto, TextEncoding};

/// Bytes read from the start of a file for detection
pub const DETECTION_HEAD_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileType {
    IntervalMeter,
    AccumulationMeter,
    EnviziWater,
    EnviziWaterBulk,
    EnviziElectricity,
    RacvElectricity,
    OptimaInterval,
    ComxPrivateWire,
    BillingReport,
    Pdf,
    Unknown,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IntervalMeter => "interval-meter",
            Self::AccumulationMeter => "accumulation-meter",
            Self::EnviziWater => "envizi-water",
            Self::EnviziWaterBulk => "envizi-water-bulk",
            Self::EnviziElectricity => "envizi-electricity",
            Self::RacvElectricity => "racv-electricity",
            Self::OptimaInterval => "optima-interval",
            Self::ComxPrivateWire => "comx-private-wire",
            Self::BillingReport => "billing-report",
            Self::Pdf => "pdf",
            Self::Unknown => "unknown",
        }
    }

    /// Documents carry no readings and are forwarded as-is
    pub fn is_document(&self) -> bool {
        matches!(self, Self::BillingReport | Self::Pdf)
    }

    /// Multi-meter formats the splitter can partition
    pub fn is_splittable(&self) -> bool {
        matches!(self, Self::IntervalMeter)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict of a classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTypeResult {
    pub file_type: FileType,
    pub encoding: TextEncoding,
    pub confidence: f32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl FileTypeResult {
    pub fn new(file_type: FileType, encoding: TextEncoding, confidence: f32) -> Self {
        Self {
            file_type,
            encoding,
            confidence: confidence.clamp(0.0, 1.0),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn unknown(encoding: TextEncoding) -> Self {
        Self::new(FileType::Unknown, encoding, 0.0)
    }

    /// Low-confidence guess recorded on an unknown result
    pub fn candidate(&self) -> Option<FileType> {
        self.metadata.get("candidate").and_then(|name| match name.as_str() {
            "interval-meter" => Some(FileType::IntervalMeter),
            "accumulation-meter" => Some(FileType::AccumulationMeter),
            "envizi-water" => Some(FileType::EnviziWater),
            "envizi-water-bulk" => Some(FileType::EnviziWaterBulk),
            "envizi-electricity" => Some(FileType::EnviziElectricity),
            "racv-electricity" => Some(FileType::RacvElectricity),
            "optima-interval" => Some(FileType::OptimaInterval),
            "comx-private-wire" => Some(FileType::ComxPrivateWire),
            _ => None,
        })
    }
}

/// One independent detection rule
pub trait Classifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when the rule does not recognise the file at all
    fn classify(&self, key: &str, head: &[u8]) -> Option<FileTypeResult>;
}

/// Priority-ordered classifier chain
pub struct TypeDetector {
    classifiers: Vec<Box<dyn Classifier>>,
    threshold: f32,
}

impl TypeDetector {
    /// Built-in chain: magic numbers, exact headers, then vendor heuristics
    pub fn new(threshold: f32) -> Self {
        use classifiers::*;

        Self::with_classifiers(
            vec![
                Box::new(PdfMagic),
                Box::new(NemHeader),
                Box::new(BillingReportName),
                Box::new(ComxBanner),
                Box::new(EnviziColumns),
                Box::new(OptimaColumns),
                Box::new(RacvColumns),
            ],
            threshold,
        )
    }

    pub fn with_classifiers(classifiers: Vec<Box<dyn Classifier>>, threshold: f32) -> Self {
        Self {
            classifiers,
            threshold,
        }
    }

    /// Append a classifier with the lowest priority
    pub fn push(&mut self, classifier: Box<dyn Classifier>) {
        self.classifiers.push(classifier);
    }

    pub fn detect(&self, key: &str, head: &[u8]) -> FileTypeResult {
        let head = &head[..head.len().min(DETECTION_HEAD_BYTES)];
        let mut best_rejected: Option<FileTypeResult> = None;

        for classifier in &self.classifiers {
            let Some(result) = classifier.classify(key, head) else {
                continue;
            };

            if result.confidence >= self.threshold {
                debug!(
                    classifier = classifier.name(),
                    file_type = %result.file_type,
                    encoding = %result.encoding,
                    confidence = result.confidence,
                    "Classified {}",
                    key
                );
                return result;
            }

            if best_rejected
                .as_ref()
                .map_or(true, |best| result.confidence > best.confidence)
            {
                best_rejected = Some(result);
            }
        }

        let encoding = decode_auto(head)
            .map(|(encoding, _)| encoding)
            .unwrap_or(TextEncoding::Binary);
        let mut unknown = FileTypeResult::unknown(encoding);
        if let Some(candidate) = best_rejected {
            unknown = unknown.with_metadata("candidate", candidate.file_type.as_str());
        }
        debug!("No confident classifier for {}", key);
        unknown
    }
}

impl Default for TypeDetector {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_DETECTION_THRESHOLD)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Fixed(&'static str, FileType, f32);

    impl Classifier for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }

        fn classify(&self, _key: &str, _head: &[u8]) -> Option<FileTypeResult> {
            Some(FileTypeResult::new(self.1, TextEncoding::Utf8, self.2))
        }
    }

    #[test]
    fn test_earlier_classifier_wins() {
        let detector = TypeDetector::with_classifiers(
            vec![
                Box::new(Fixed("first", FileType::OptimaInterval, 0.9)),
                Box::new(Fixed("second", FileType::RacvElectricity, 1.0)),
            ],
            0.8,
        );
        assert_eq!(detector.detect("a.csv", b"x").file_type, FileType::OptimaInterval);
    }

    #[test]
    fn test_low_confidence_is_skipped() {
        let detector = TypeDetector::with_classifiers(
            vec![
                Box::new(Fixed("weak", FileType::OptimaInterval, 0.5)),
                Box::new(Fixed("strong", FileType::RacvElectricity, 0.9)),
            ],
            0.8,
        );
        assert_eq!(detector.detect("a.csv", b"x").file_type, FileType::RacvElectricity);
    }

    #[test]
    fn test_no_match_is_unknown_with_candidate() {
        let detector = TypeDetector::with_classifiers(
            vec![Box::new(Fixed("weak", FileType::EnviziWater, 0.4))],
            0.8,
        );
        let result = detector.detect("a.csv", b"Serial_No");
        assert_eq!(result.file_type, FileType::Unknown);
        assert_eq!(result.encoding, TextEncoding::Utf8);
        assert_eq!(result.candidate(), Some(FileType::EnviziWater));
    }

    #[test]
    fn test_pushed_classifier_runs_last() {
        let mut detector = TypeDetector::with_classifiers(Vec::new(), 0.8);
        detector.push(Box::new(Fixed("late", FileType::ComxPrivateWire, 0.95)));
        assert_eq!(detector.detect("a.csv", b"").file_type, FileType::ComxPrivateWire);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let detector = TypeDetector::with_classifiers(
            vec![Box::new(Fixed("edge", FileType::OptimaInterval, 0.8))],
            0.8,
        );
        assert_eq!(detector.detect("a.csv", b"x").file_type, FileType::OptimaInterval);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&FileType::IntervalMeter).unwrap();
        assert_eq!(json, "\"interval-meter\"");
        let json = serde_json::to_string(&TextEncoding::Utf16Le).unwrap();
        assert_eq!(json, "\"utf-16-le\"");
    }
}
