use std::path::Path;

use crate::models::config::DataFormat;

/// One link in the format detection chain. Returns `Unknown` to defer to the next.
pub trait FormatDetector: Send + Sync {
    fn detect(&self, filename: &str, head: &[u8]) -> DataFormat;
}

/// Detects by file extension.
pub struct ExtensionDetector;

impl FormatDetector for ExtensionDetector {
    fn detect(&self, filename: &str, _head: &[u8]) -> DataFormat {
        Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse::<DataFormat>().ok())
            .unwrap_or(DataFormat::Unknown)
    }
}

/// Sniffs the first bytes of the payload.
pub struct ContentDetector;

impl FormatDetector for ContentDetector {
    fn detect(&self, _filename: &str, head: &[u8]) -> DataFormat {
        let text = String::from_utf8_lossy(head);
        let trimmed = text.trim_start_matches('\u{feff}').trim_start();

        match trimmed.chars().next() {
            Some('{') | Some('[') => DataFormat::Json,
            Some(_) => {
                let first_line = trimmed.lines().next().unwrap_or_default().to_lowercase();
                if first_line.contains(',') && first_line.contains("date") {
                    DataFormat::Csv
                } else {
                    DataFormat::Unknown
                }
            }
            None => DataFormat::Unknown,
        }
    }
}

/// Ordered chain of detectors; the first definite answer wins.
pub struct DetectorChain {
    detectors: Vec<Box<dyn FormatDetector>>,
}

impl Default for DetectorChain {
    fn default() -> Self {
        Self::new(vec![Box::new(ExtensionDetector), Box::new(ContentDetector)])
    }
}

impl DetectorChain {
    pub fn new(detectors: Vec<Box<dyn FormatDetector>>) -> Self {
        Self { detectors }
    }

    pub fn detect(&self, filename: &str, head: &[u8]) -> DataFormat {
        self.detectors
            .iter()
            .map(|d| d.detect(filename, head))
            .find(|format| *format != DataFormat::Unknown)
            .unwrap_or(DataFormat::Unknown)
    }
}

/// Detect with the default extension-then-content chain.
pub fn detect_format(filename: &str, head: &[u8]) -> DataFormat {
    DetectorChain::default().detect(filename, head)
}
