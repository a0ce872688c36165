use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::diagnostics::DiagnosticSink;
use crate::errors::AppResult;
use crate::extractor::{clean_token, CandidateExtractor};
use crate::geocoder::{BoundedGeocoder, Resolution};
use crate::queries::{build_queries, promote_areas};
use crate::store::{MergeOutcome, PlaceRecord, PlaceStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    EmptyMessage,
    NothingToGeocode,
    NothingGeocoded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Skipped { reason: SkipReason },
    Inserted { place: PlaceRecord, resolution: Resolution },
    Updated { place: PlaceRecord, resolution: Resolution },
}

impl Outcome {
    pub fn place(&self) -> Option<&PlaceRecord> {
        match self {
            Outcome::Skipped { .. } => None,
            Outcome::Inserted { place, .. } | Outcome::Updated { place, .. } => Some(place),
        }
    }

    fn skipped(reason: SkipReason) -> Self {
        debug!(?reason, "message skipped");
        Outcome::Skipped { reason }
    }
}

pub struct ResolutionPipeline {
    extractor: Arc<CandidateExtractor>,
    geocoder: Arc<BoundedGeocoder>,
    store: PlaceStore,
    region_hint: String,
    diagnostics: DiagnosticSink,
}

impl ResolutionPipeline {
    pub fn new(
        extractor: Arc<CandidateExtractor>,
        geocoder: Arc<BoundedGeocoder>,
        store: PlaceStore,
        region_hint: impl Into<String>,
        diagnostics: DiagnosticSink,
    ) -> Self {
        Self {
            extractor,
            geocoder,
            store,
            region_hint: region_hint.into(),
            diagnostics,
        }
    }

    pub fn store(&self) -> &PlaceStore {
        &self.store
    }

    // Only store failures are returned as errors.
    pub async fn handle_message(&self, text: &str, now: DateTime<Utc>) -> AppResult<Outcome> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Outcome::skipped(SkipReason::EmptyMessage));
        }

        let candidates = self.extractor.extract(text).await;
        debug!(?candidates, "extracted candidates");

        let mut objects = promote_areas(candidates.objects, &candidates.areas);
        if objects.is_empty() {
            if let Some(first) = first_word(text) {
                objects.push(first);
            }
        }
        if objects.is_empty() {
            return Ok(Outcome::skipped(SkipReason::NothingToGeocode));
        }

        let queries = build_queries(&objects, &candidates.areas, &self.region_hint);
        debug!(?queries, "geocoding queries");

        let Some(resolution) = self.geocoder.resolve(&queries).await else {
            return Ok(Outcome::skipped(SkipReason::NothingGeocoded));
        };
        info!(
            query = %resolution.query,
            lat = resolution.coordinate.lat,
            lon = resolution.coordinate.lon,
            "resolved place"
        );

        let merged = self
            .store
            .merge(&resolution.query, resolution.coordinate, now)
            .await?;
        self.diagnostics.emit(
            "place_merged",
            json!({
                "id": merged.record().id,
                "name": merged.record().name,
                "confirmations": merged.record().confirmations,
                "path": resolution.path,
            }),
        );

        Ok(match merged {
            MergeOutcome::Inserted(place) => Outcome::Inserted { place, resolution },
            MergeOutcome::Updated(place) => Outcome::Updated { place, resolution },
        })
    }
}

fn first_word(text: &str) -> Option<String> {
    text.split_whitespace()
        .next()
        .map(clean_token)
        .filter(|word| !word.is_empty())
}
