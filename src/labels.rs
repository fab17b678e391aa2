use crate::config::LabelsConfig;
use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

/// Class names in the order of the classifier's output scores.
pub const CLASS_LABELS: [&str; 48] = [
    "01 Real Estate Agent",
    "04 Financial Planner",
    "05 Economist",
    "02 Stock Broker",
    "06 Politician",
    "08 Entrepreneur",
    "07 Journalist",
    "03 Banker",
    "09 Divorce",
    "10 Corruption",
    "12 Critical Illness",
    "14 Illness",
    "11 Vacation",
    "13 Accident",
    "15 Baby",
    "16-Retrenchment",
    "17 Pay Raise",
    "20 Natural Disaster",
    "21 Interest Rate Rises",
    "30 Property Market Crash",
    "22 Interest Rate Falls",
    "23 Government Raises Tax",
    "29 Property Bubble",
    "25 Partisan Politics",
    "24 Government Lowers Tax",
    "26 Political Turmoil",
    "28 Stock Fever",
    "27 Debt Crisis",
    "31 Stock Market Crash",
    "36 Information Overload",
    "35 Land Rezoning",
    "34 Credit rating Downgrade",
    "18 Hot Money",
    "37 New Technology",
    "19 Government Bailout",
    "32 Inflation",
    "33 Stock Panic",
    "45 Property",
    "44 Stock",
    "40 Convertible Bond",
    "46 Bond",
    "39 Undeveloped Land",
    "41 Junk Bond",
    "43 Dividend Stock",
    "42 Growth Stock",
    "38 Hotel",
    "48 Insurance",
    "47 Trust Fund",
];

#[derive(Debug, Clone)]
pub struct ClassLabels {
    labels: Vec<String>,
}

impl ClassLabels {
    pub fn new(labels_cfg: &LabelsConfig) -> Result<Self, String> {
        match &labels_cfg.labels_file {
            Some(path) => match load_labels(path) {
                Ok(labels) if labels.is_empty() => {
                    Err(format!("Labels file {:?} contains no labels", path))
                }
                Ok(labels) => Ok(Self { labels }),
                Err(e) => Err(format!("Failed to load labels from {:?}: {}", path, e)),
            },
            None => Ok(Self::default()),
        }
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }
}

impl Default for ClassLabels {
    fn default() -> Self {
        Self {
            labels: CLASS_LABELS.iter().map(|l| l.to_string()).collect(),
        }
    }
}

/// Reads one label per line, skipping blank lines.
pub fn load_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let label = line.trim();
        if !label.is_empty() {
            labels.push(label.to_string());
        }
    }

    Ok(labels)
}
