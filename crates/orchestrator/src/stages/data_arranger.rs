//! Fourth stage: map extracted data points onto the configured taxonomy.
//!
//! Purely deterministic. Every declared field appears in the output, either
//! with the values found for it or explicitly marked as not found.

use async_trait::async_trait;
use docflow_core::{
    ArrangedCategory, ArrangedData, ArrangedField, ArrangedValue, DataPoint, ExtractedData,
    StageName, StagePayload, Taxonomy,
};
use tracing::debug;

use crate::core::{Stage, StageInput, StageOutcome};

pub struct DataArranger {
    taxonomy: Taxonomy,
}

impl DataArranger {
    pub fn new(taxonomy: Taxonomy) -> Self {
        Self { taxonomy }
    }

    pub fn arrange(&self, extracted: &ExtractedData) -> ArrangedData {
        let index = self.taxonomy.index();
        let mut buckets: Vec<Vec<Vec<DataPoint>>> = self
            .taxonomy
            .categories
            .iter()
            .map(|c| vec![Vec::new(); c.fields.len()])
            .collect();
        let mut unmapped = Vec::new();

        for point in &extracted.data_points {
            let key = docflow_core::normalize_field_name(&point.field_name);
            match index.get(&key) {
                Some(&(ci, fi)) => {
                    let bucket = &mut buckets[ci][fi];
                    // Same value reported twice for the same period: keep the
                    // more confident one.
                    match bucket
                        .iter_mut()
                        .find(|p| p.value == point.value && p.period == point.period)
                    {
                        Some(existing) if existing.confidence < point.confidence => {
                            *existing = point.clone();
                        }
                        Some(_) => {}
                        None => bucket.push(point.clone()),
                    }
                }
                None => unmapped.push(point.clone()),
            }
        }

        let categories: Vec<ArrangedCategory> = self
            .taxonomy
            .categories
            .iter()
            .zip(buckets)
            .map(|(spec, fields)| ArrangedCategory {
                name: spec.name.clone(),
                fields: spec
                    .fields
                    .iter()
                    .zip(fields)
                    .map(|(field, values)| ArrangedField {
                        name: field.name.clone(),
                        kind: field.kind,
                        value: if values.is_empty() {
                            ArrangedValue::NotFound
                        } else {
                            ArrangedValue::Found { values }
                        },
                    })
                    .collect(),
            })
            .collect();

        let total = self.taxonomy.field_count();
        let mut arranged = ArrangedData {
            categories,
            unmapped,
            completeness: 0.0,
            summary: String::new(),
        };
        let found = arranged.found_count();
        if total > 0 {
            arranged.completeness = found as f64 / total as f64;
        }
        let missing_required: Vec<&str> = self
            .taxonomy
            .categories
            .iter()
            .flat_map(|c| c.fields.iter().map(move |f| (c, f)))
            .filter(|(c, f)| {
                f.required
                    && !arranged
                        .field(&c.name, &f.name)
                        .map(ArrangedValue::is_found)
                        .unwrap_or(false)
            })
            .map(|(_, f)| f.name.as_str())
            .collect();

        arranged.summary = format!(
            "{} of {} fields found across {} categories; {} unmapped value(s)",
            found,
            total,
            arranged.categories.len(),
            arranged.unmapped.len()
        );
        if !missing_required.is_empty() {
            arranged
                .summary
                .push_str(&format!("; missing required: {}", missing_required.join(", ")));
        }
        arranged
    }
}

#[async_trait]
impl Stage for DataArranger {
    fn name(&self) -> StageName {
        StageName::DataArranger
    }

    async fn execute(&self, input: &StageInput) -> StageOutcome {
        let arranged = self.arrange(input.extracted()?);
        debug!(
            run_id = %input.run_id,
            completeness = arranged.completeness,
            unmapped = arranged.unmapped.len(),
            "Data arranged"
        );
        Ok(StagePayload::Arranged(arranged))
    }
}
