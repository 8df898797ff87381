//! Built-in classifiers, in the order [`super::TypeDetector::new`] runs them

use super::encoding::{decode_auto, TextEncoding, CANDIDATE_ENCODINGS};
use super::{Classifier, FileType, FileTypeResult};

const PDF_MAGIC: &[u8] = b"%PDF-";
const COMX_DEVICE: &str = "ComX510_Green_Square";
const BILLING_REPORT_NAME: &str = "RACV-Usage and Spend Report";
const GENERATION_EXPORT_NAME: &str = "OptimaGenerationData";

/// Column-check verdict, raised when the file name also names the vendor
const COLUMN_MATCH_CONFIDENCE: f32 = 0.9;
const NAMED_MATCH_CONFIDENCE: f32 = 0.95;

/// Fields of one CSV line, trimmed
fn fields(line: &str) -> Vec<String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    reader
        .records()
        .next()
        .and_then(Result::ok)
        .map(|record| record.iter().map(|f| f.trim().to_string()).collect())
        .unwrap_or_default()
}

fn nth_line(text: &str, n: usize) -> Option<&str> {
    text.lines().nth(n)
}

fn has_column(columns: &[String], name: &str) -> bool {
    columns.iter().any(|c| c == name)
}

fn name_contains(key: &str, needle: &str) -> bool {
    key.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
}

fn vendor_confidence(key: &str, vendor: &str) -> f32 {
    if name_contains(key, vendor) {
        NAMED_MATCH_CONFIDENCE
    } else {
        COLUMN_MATCH_CONFIDENCE
    }
}

/// `%PDF-` magic number
pub struct PdfMagic;

impl Classifier for PdfMagic {
    fn name(&self) -> &'static str {
        "pdf-magic"
    }

    fn classify(&self, _key: &str, head: &[u8]) -> Option<FileTypeResult> {
        head.starts_with(PDF_MAGIC)
            .then(|| FileTypeResult::new(FileType::Pdf, TextEncoding::Binary, 1.0))
    }
}

/// Exact `100,NEM12` / `100,NEM13` header under each candidate encoding
pub struct NemHeader;

impl Classifier for NemHeader {
    fn name(&self) -> &'static str {
        "nem-header"
    }

    fn classify(&self, _key: &str, head: &[u8]) -> Option<FileTypeResult> {
        CANDIDATE_ENCODINGS.iter().find_map(|encoding| {
            let text = encoding.decode(head)?;
            let header = fields(text.lines().next()?);
            if header.first().map(String::as_str) != Some("100") {
                return None;
            }
            let file_type = match header.get(1).map(String::as_str) {
                Some("NEM12") => FileType::IntervalMeter,
                Some("NEM13") => FileType::AccumulationMeter,
                _ => return None,
            };
            let mut result = FileTypeResult::new(file_type, *encoding, 1.0)
                .with_metadata("version", header[1].as_str());
            if let Some(from) = header.get(3).filter(|p| !p.is_empty()) {
                result = result.with_metadata("from_participant", from.as_str());
            }
            Some(result)
        })
    }
}

/// Usage and spend exports, recognised by name alone
pub struct BillingReportName;

impl Classifier for BillingReportName {
    fn name(&self) -> &'static str {
        "billing-report-name"
    }

    fn classify(&self, key: &str, head: &[u8]) -> Option<FileTypeResult> {
        if !key.contains(BILLING_REPORT_NAME) || key.contains(GENERATION_EXPORT_NAME) {
            return None;
        }
        let encoding = decode_auto(head).map_or(TextEncoding::Binary, |(e, _)| e);
        Some(FileTypeResult::new(FileType::BillingReport, encoding, NAMED_MATCH_CONFIDENCE))
    }
}

/// ComX private-wire export; the device name sits on the second row
pub struct ComxBanner;

impl Classifier for ComxBanner {
    fn name(&self) -> &'static str {
        "comx-banner"
    }

    fn classify(&self, _key: &str, head: &[u8]) -> Option<FileTypeResult> {
        let (encoding, text) = decode_auto(head)?;
        let banner = fields(nth_line(&text, 1)?);
        if banner.first().map(String::as_str) != Some(COMX_DEVICE) {
            return None;
        }
        let site = banner.get(4).map(|s| s.replace(' ', "")).unwrap_or_default();
        Some(
            FileTypeResult::new(FileType::ComxPrivateWire, encoding, NAMED_MATCH_CONFIDENCE)
                .with_metadata("site", site),
        )
    }
}

/// Envizi vertical exports, told apart by their value columns
pub struct EnviziColumns;

impl Classifier for EnviziColumns {
    fn name(&self) -> &'static str {
        "envizi-columns"
    }

    fn classify(&self, key: &str, head: &[u8]) -> Option<FileTypeResult> {
        if key.contains(GENERATION_EXPORT_NAME) {
            return None;
        }
        let (encoding, text) = decode_auto(head)?;
        let columns = fields(text.lines().next()?);
        if !has_column(&columns, "Serial_No") {
            return None;
        }

        let file_type = if has_column(&columns, "Interval_Start")
            && has_column(&columns, "Consumption")
            && has_column(&columns, "Consumption Unit")
        {
            FileType::EnviziWater
        } else if has_column(&columns, "Interval_Start") && has_column(&columns, "kWh") {
            FileType::EnviziElectricity
        } else if has_column(&columns, "Date_Time") && has_column(&columns, "kL") {
            FileType::EnviziWaterBulk
        } else {
            return None;
        };

        Some(FileTypeResult::new(file_type, encoding, vendor_confidence(key, "envizi")))
    }
}

/// Optima interval exports
pub struct OptimaColumns;

impl Classifier for OptimaColumns {
    fn name(&self) -> &'static str {
        "optima-columns"
    }

    fn classify(&self, key: &str, head: &[u8]) -> Option<FileTypeResult> {
        let (encoding, text) = decode_auto(head)?;
        let columns = fields(text.lines().next()?);
        let keyed = has_column(&columns, "Identifier")
            && has_column(&columns, "Date")
            && has_column(&columns, "Start Time");
        let valued = has_column(&columns, "Usage") || has_column(&columns, "Generation");
        (keyed && valued).then(|| {
            FileTypeResult::new(FileType::OptimaInterval, encoding, vendor_confidence(key, "optima"))
        })
    }
}

/// RACV electricity reports: two preamble rows, then per-meter kWh columns
pub struct RacvColumns;

impl Classifier for RacvColumns {
    fn name(&self) -> &'static str {
        "racv-columns"
    }

    fn classify(&self, key: &str, head: &[u8]) -> Option<FileTypeResult> {
        if key.contains(GENERATION_EXPORT_NAME) {
            return None;
        }
        let (encoding, text) = decode_auto(head)?;
        let columns = fields(nth_line(&text, 2)?);
        let matched = has_column(&columns, "Date")
            && has_column(&columns, "Start Time")
            && columns.iter().any(|c| c.contains("kWh"));
        matched.then(|| {
            FileTypeResult::new(FileType::RacvElectricity, encoding, vendor_confidence(key, "racv"))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::detect::TypeDetector;

    fn utf16le(text: &str) -> Vec<u8> {
        text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    #[test]
    fn test_nem12_utf8() {
        let head = b"100,NEM12,202601010000,MDA1,RETAILER\n200,NMI0000001,E1,1,E1,N1,M1,KWH,30,\n";
        let result = NemHeader.classify("x.csv", head).unwrap();
        assert_eq!(result.file_type, FileType::IntervalMeter);
        assert_eq!(result.encoding, TextEncoding::Utf8);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.metadata["from_participant"], "MDA1");
    }

    #[test]
    fn test_nem12_utf16le_header() {
        let head = utf16le("100,NEM12,202601010000,MDA1,RETAILER\r\n200,NMI0000001,E1");
        let result = TypeDetector::default().detect("landing/file.csv", &head);
        assert_eq!(result.file_type, FileType::IntervalMeter);
        assert_eq!(result.encoding, TextEncoding::Utf16Le);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_nem13_header() {
        let result = NemHeader.classify("x.csv", b"100,NEM13,202601010000,A,B\n").unwrap();
        assert_eq!(result.file_type, FileType::AccumulationMeter);
    }

    #[test]
    fn test_other_nem_version_not_claimed() {
        assert!(NemHeader.classify("x.csv", b"100,NEM14,202601010000\n").is_none());
    }

    #[test]
    fn test_pdf_magic() {
        let result = TypeDetector::default().detect("invoice.csv", b"%PDF-1.7\n%binary");
        assert_eq!(result.file_type, FileType::Pdf);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_envizi_variants() {
        let water = b"Serial_No,Interval_Start,Interval_End,Consumption,Consumption Unit\n";
        let elec = b"Serial_No,Interval_Start,Interval_End,kWh\n";
        let bulk = b"Serial_No,Date_Time,kL\n";

        assert_eq!(
            EnviziColumns.classify("a.csv", water).unwrap().file_type,
            FileType::EnviziWater
        );
        assert_eq!(
            EnviziColumns.classify("a.csv", elec).unwrap().file_type,
            FileType::EnviziElectricity
        );
        let named = EnviziColumns.classify("Envizi_bulk.csv", bulk).unwrap();
        assert_eq!(named.file_type, FileType::EnviziWaterBulk);
        assert_eq!(named.confidence, NAMED_MATCH_CONFIDENCE);
        assert!(EnviziColumns.classify("OptimaGenerationData.csv", elec).is_none());
    }

    #[test]
    fn test_racv_and_optima() {
        let racv = b"Report,RACV\nSite,Noble Park\nDate,Start Time,3051234567 kWh,3057654321 kWh\n";
        assert_eq!(
            TypeDetector::default().detect("racv_export.csv", racv).file_type,
            FileType::RacvElectricity
        );

        let optima = b"Identifier,Date,Start Time,Usage,Generation\n";
        assert_eq!(
            TypeDetector::default().detect("x.csv", optima).file_type,
            FileType::OptimaInterval
        );
    }

    #[test]
    fn test_comx_banner() {
        let head = b"Device,Model,Serial,Firmware,Site\nComX510_Green_Square,ComX,123,1.0,Green Square East\n";
        let result = ComxBanner.classify("x.csv", head).unwrap();
        assert_eq!(result.file_type, FileType::ComxPrivateWire);
        assert_eq!(result.metadata["site"], "GreenSquareEast");
    }

    #[test]
    fn test_billing_report_beats_column_heuristics() {
        let head = b"Report,RACV\nSite,All\nDate,Start Time,x kWh\n";
        let result = TypeDetector::default().detect("RACV-Usage and Spend Report 2026.csv", head);
        assert_eq!(result.file_type, FileType::BillingReport);
    }

    #[test]
    fn test_unrecognised_csv_is_unknown() {
        let result = TypeDetector::default().detect("x.csv", b"a,b,c\n1,2,3\n");
        assert_eq!(result.file_type, FileType::Unknown);
        assert_eq!(result.confidence, 0.0);
    }
}
