use crate::store::write_atomically;
use crate::IngestError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PatientRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nric: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blood_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allergies: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctor: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnoses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
}

impl PatientRecord {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.nric.is_none() && self.diagnoses.is_empty()
    }
}

/// Field patterns for the patient intake form layout.
#[derive(Debug, Clone)]
pub struct PatientExtractor {
    name: Regex,
    nric: Regex,
    age: Regex,
    gender: Regex,
    blood_type: Regex,
    allergies: Regex,
    doctor: Regex,
    diagnosis_item: Regex,
    date: Regex,
    next_label: Regex,
}

impl PatientExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            name: Regex::new(r"Full name of patient\s*([^\n]+)")?,
            nric: Regex::new(r"NRIC / MyKad no\.\s*([^\n]+)")?,
            age: Regex::new(r"Age of patient\s*(\d+)")?,
            gender: Regex::new(r"Gender\s*(Male|Female)")?,
            blood_type: Regex::new(r"Blood type\s*([^\n]+)")?,
            allergies: Regex::new(r"Allergies\s*([^\n]+)")?,
            doctor: Regex::new(r"Full name of doctor\s*([^\n]+)")?,
            diagnosis_item: Regex::new(r"(?:^|\s)\d+\.\s+")?,
            date: Regex::new(r"\b(\d{1,2} [A-Za-z]+ \d{4})\b")?,
            next_label: Regex::new(
                r"SECTION|Full name of patient|Full name of doctor|Diagnosis|Age of patient|Gender|Blood type|Allergies|MCR|NRIC / MyKad no\.",
            )?,
        })
    }

    /// Cuts a captured value at the next form label.
    fn clean(&self, value: &str) -> Option<String> {
        let end = self
            .next_label
            .find(value)
            .map_or(value.len(), |found| found.start());
        let cleaned = value[..end].trim();
        (!cleaned.is_empty()).then(|| cleaned.to_string())
    }

    fn field(&self, pattern: &Regex, text: &str) -> Option<String> {
        pattern
            .captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|value| self.clean(value.as_str()))
    }

    fn diagnoses(&self, text: &str) -> Vec<String> {
        let Some(start) = text.find("Diagnosis") else {
            return Vec::new();
        };
        let section = &text[start..];
        let markers: Vec<_> = self.diagnosis_item.find_iter(section).collect();

        markers
            .iter()
            .enumerate()
            .filter_map(|(index, marker)| {
                let end = markers
                    .get(index + 1)
                    .map_or(section.len(), |next| next.start());
                self.clean(&section[marker.end()..end])
            })
            .collect()
    }

    /// Later chunks override fields found in earlier ones.
    pub fn extract<'a>(&self, texts: impl IntoIterator<Item = &'a str>) -> PatientRecord {
        let mut record = PatientRecord::default();

        for text in texts {
            if let Some(name) = self.field(&self.name, text) {
                record.name = Some(name);
            }
            if let Some(nric) = self.field(&self.nric, text) {
                record.nric = Some(nric);
            }
            if let Some(age) = self
                .age
                .captures(text)
                .and_then(|caps| caps.get(1))
                .and_then(|value| value.as_str().parse().ok())
            {
                record.age = Some(age);
            }
            if let Some(gender) = self
                .gender
                .captures(text)
                .and_then(|caps| caps.get(1))
            {
                record.gender = Some(gender.as_str().to_string());
            }
            if let Some(blood_type) = self.field(&self.blood_type, text) {
                record.blood_type = Some(blood_type);
            }
            if let Some(allergies) = self.field(&self.allergies, text) {
                record.allergies = Some(allergies);
            }
            if let Some(doctor) = self.field(&self.doctor, text) {
                record.doctor = Some(doctor);
            }
            let diagnoses = self.diagnoses(text);
            if !diagnoses.is_empty() {
                record.diagnoses = diagnoses;
            }
            if let Some(date) = self.date.captures(text).and_then(|caps| caps.get(1)) {
                record.date = Some(date.as_str().to_string());
            }
        }

        record
    }
}

pub fn extract_patient_record<'a>(
    texts: impl IntoIterator<Item = &'a str>,
) -> Result<PatientRecord, IngestError> {
    let extractor = PatientExtractor::new()
        .map_err(|error| IngestError::InvalidArgument(error.to_string()))?;
    Ok(extractor.extract(texts))
}

/// JSON file of patient records keyed by NRIC.
pub struct PatientRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PatientRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<PatientRecord>, IngestError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Appends the records whose NRIC is not yet registered; returns how many were added.
    pub fn upsert(&self, records: Vec<PatientRecord>) -> Result<usize, IngestError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut registered = self.load()?;
        let mut known: HashSet<Option<String>> =
            registered.iter().map(|record| record.nric.clone()).collect();

        let before = registered.len();
        for record in records {
            if known.insert(record.nric.clone()) {
                registered.push(record);
            } else {
                debug!(nric = ?record.nric, "patient already registered");
            }
        }

        let added = registered.len() - before;
        if added > 0 {
            if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            write_atomically(&self.path, &serde_json::to_vec_pretty(&registered)?)?;
            info!(added, total = registered.len(), path = %self.path.display(), "patient registry updated");
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const FORM: &str = "SECTION A Full name of patient Jane Tan Mei Ling NRIC / MyKad no. 900101-14-5678 \
        Age of patient 34 Gender Female Blood type O+ Allergies Penicillin \
        SECTION B Full name of doctor Dr. Ahmad Faiz MCR 12345 Date 12 March 2024";

    #[test]
    fn form_fields_are_cut_at_the_next_label() -> Result<(), Box<dyn std::error::Error>> {
        let record = extract_patient_record([FORM])?;

        assert_eq!(record.name.as_deref(), Some("Jane Tan Mei Ling"));
        assert_eq!(record.nric.as_deref(), Some("900101-14-5678"));
        assert_eq!(record.age, Some(34));
        assert_eq!(record.gender.as_deref(), Some("Female"));
        assert_eq!(record.blood_type.as_deref(), Some("O+"));
        assert_eq!(record.allergies.as_deref(), Some("Penicillin"));
        assert_eq!(record.doctor.as_deref(), Some("Dr. Ahmad Faiz"));
        assert_eq!(record.date.as_deref(), Some("12 March 2024"));
        Ok(())
    }

    #[test]
    fn numbered_diagnoses_are_split() -> Result<(), Box<dyn std::error::Error>> {
        let record = extract_patient_record([
            FORM,
            "Diagnosis 1. Dengue fever 2. Essential hypertension\n3. Type 2 diabetes",
        ])?;

        assert_eq!(
            record.diagnoses,
            vec!["Dengue fever", "Essential hypertension", "Type 2 diabetes"]
        );
        assert_eq!(record.name.as_deref(), Some("Jane Tan Mei Ling"));
        Ok(())
    }

    #[test]
    fn registry_skips_known_nric() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let registry = PatientRegistry::new(dir.path().join("structured").join("patients.json"));
        let jane = extract_patient_record([FORM])?;

        assert_eq!(registry.upsert(vec![jane.clone()])?, 1);
        let mut renamed = jane.clone();
        renamed.name = Some("J. Tan".to_string());
        assert_eq!(registry.upsert(vec![renamed])?, 0);

        let other = PatientRecord {
            name: Some("Ali bin Hassan".to_string()),
            nric: Some("850505-10-1234".to_string()),
            ..PatientRecord::default()
        };
        assert_eq!(registry.upsert(vec![other])?, 1);

        let stored = registry.load()?;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0], jane);
        Ok(())
    }
}
