pub mod commands;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod errors;
pub mod extractor;
pub mod geo;
pub mod geocoder;
pub mod lexicon;
pub mod pipeline;
pub mod queries;
pub mod store;
pub mod sweeper;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::AppConfig;
use crate::db::{bootstrap, DatabaseContext};
use crate::diagnostics::DiagnosticSink;
use crate::errors::AppResult;
use crate::extractor::CandidateExtractor;
use crate::geocoder::{BoundedGeocoder, NominatimClient};
use crate::lexicon::Lexicon;
use crate::pipeline::ResolutionPipeline;
use crate::store::{PlaceStore, RetryPolicy};
use crate::sweeper::TtlSweeper;

pub use crate::errors::AppError;
pub use crate::geo::Coordinate;
pub use crate::pipeline::{Outcome, SkipReason};
pub use crate::store::PlaceRecord;

pub struct AppState {
    config: AppConfig,
    db_path: PathBuf,
    diagnostics: DiagnosticSink,
    store: PlaceStore,
    pipeline: Arc<ResolutionPipeline>,
    sweeper: TtlSweeper,
}

impl AppState {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        let data_dir = config.data_dir.clone();
        std::fs::create_dir_all(&data_dir)?;

        let lexicon = Arc::new(Lexicon::load(config.lexicon_path.as_deref())?);
        let diagnostics = DiagnosticSink::new(&data_dir, &config)?;
        let DatabaseContext { connection, path } = bootstrap(
            &data_dir,
            &config.database_file_name,
            config.db_busy_timeout(),
        )?;
        let store = PlaceStore::new(
            Arc::new(Mutex::new(connection)),
            RetryPolicy::from_config(&config),
        );

        let lookup = Arc::new(NominatimClient::new(&config)?);
        let geocoder = BoundedGeocoder::new(
            lookup,
            Arc::clone(&lexicon),
            &config,
            diagnostics.clone(),
        );
        let extractor =
            CandidateExtractor::from_config(&config, Arc::clone(&lexicon), diagnostics.clone())?;
        if config.model_api_key.is_none() {
            info!("no model key configured; extracting candidates heuristically");
        }

        let pipeline = ResolutionPipeline::new(
            Arc::new(extractor),
            Arc::new(geocoder),
            store.clone(),
            config.region_hint.clone(),
            diagnostics.clone(),
        );
        let sweeper = TtlSweeper::new(
            store.clone(),
            config.ttl(),
            config.sweep_interval(),
            diagnostics.clone(),
        );

        info!(
            city = %config.city_name,
            radius_km = config.max_distance_km,
            ttl_hours = config.ttl_hours,
            "chatmap initialised"
        );
        Ok(Self {
            config,
            db_path: path,
            diagnostics,
            store,
            pipeline: Arc::new(pipeline),
            sweeper,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn diagnostics(&self) -> &DiagnosticSink {
        &self.diagnostics
    }

    pub fn store(&self) -> &PlaceStore {
        &self.store
    }

    pub fn pipeline(&self) -> Arc<ResolutionPipeline> {
        Arc::clone(&self.pipeline)
    }

    pub fn sweeper(&self) -> &TtlSweeper {
        &self.sweeper
    }

    pub fn shutdown(&self) {
        if let Err(err) = self.diagnostics.flush() {
            warn!(?err, "failed to flush diagnostics");
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,chatmap=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}

// Invalid UTF-8 is replaced, not rejected.
pub async fn next_message<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    let text = String::from_utf8_lossy(buf);
    if let std::borrow::Cow::Owned(_) = text {
        warn!("message contained invalid UTF-8; replaced");
    }
    Ok(Some(text.into_owned()))
}
