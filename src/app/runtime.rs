use std::io;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use clap::Parser;
use tracing::{debug, error, info, warn};
use url::Url;

use super::config::{Credentials, Settings};
use super::download::ImageFetcher;
use super::error::RunError;
use super::extract::extract_candidates;
use super::fetch::{PageFetcher, build_http_client};
use super::filter::CandidateFilter;
use super::logging::init_logging;
use super::naming::filename_for;
use super::sink::{LocalSink, Sink};
use super::types::{AcceptedImage, Cli};

const SUMMARY_RULE_WIDTH: usize = 50;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunStage {
    Idle,
    Fetching,
    Extracting,
    Filtering,
    Downloading,
    Deciding,
    Persisting,
    Reporting,
    Done,
}

impl RunStage {
    pub fn label(self) -> &'static str {
        match self {
            RunStage::Idle => "idle",
            RunStage::Fetching => "fetching",
            RunStage::Extracting => "extracting",
            RunStage::Filtering => "filtering",
            RunStage::Downloading => "downloading",
            RunStage::Deciding => "deciding",
            RunStage::Persisting => "persisting",
            RunStage::Reporting => "reporting",
            RunStage::Done => "done",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Downloaded,
    Skipped,
    Errored,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub downloaded: usize,
    pub skipped: usize,
    pub errored: usize,
    pub aborted: Option<RunError>,
}

impl RunReport {
    fn aborted(err: RunError) -> Self {
        Self {
            aborted: Some(err),
            ..Self::default()
        }
    }

    pub fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Downloaded => self.downloaded += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Errored => self.errored += 1,
        }
    }

    pub fn summary_line(&self) -> String {
        format!(
            "downloaded={} skipped={} errored={}",
            self.downloaded, self.skipped, self.errored
        )
    }
}

/// Sleeps between items, never after the last one.
struct Pacer {
    interval: Duration,
    remaining: usize,
}

impl Pacer {
    fn new(interval: Duration, total: usize) -> Self {
        Self {
            interval,
            remaining: total,
        }
    }

    async fn after_item(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining > 0 && !self.interval.is_zero() {
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// One pass over one page: fetch, extract, filter, then download and store
/// each accepted image in order.
pub struct Runner {
    target: Url,
    fetcher: PageFetcher,
    filter: CandidateFilter,
    images: ImageFetcher,
    sink: Sink,
    today: NaiveDate,
    pacing: Duration,
    dry_run: bool,
    stage: RunStage,
}

impl Runner {
    pub fn from_settings(settings: &Settings, sink: Sink, today: NaiveDate) -> io::Result<Self> {
        let page_client = build_http_client(&settings.user_agent, settings.page_timeout())
            .map_err(io::Error::other)?;
        let image_client = build_http_client(&settings.user_agent, settings.image_timeout())
            .map_err(io::Error::other)?;
        Ok(Self {
            target: settings.target_url()?,
            fetcher: PageFetcher::from_settings(settings, page_client),
            filter: CandidateFilter::for_mode(settings.mode, settings),
            images: ImageFetcher::new(image_client),
            sink,
            today,
            pacing: settings.pacing(),
            dry_run: settings.dry_run,
            stage: RunStage::Idle,
        })
    }

    pub fn stage(&self) -> RunStage {
        self.stage
    }

    pub async fn run(&mut self) -> RunReport {
        let accepted = match self.collect().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("[{}] {}: {err}", self.stage.label(), self.target);
                self.enter(RunStage::Done);
                return RunReport::aborted(err);
            }
        };

        let mut report = RunReport::default();
        if self.dry_run {
            for image in &accepted {
                info!(
                    "dry run: {} [{}] -> {}",
                    image.url(),
                    image.candidate().source.label(),
                    filename_for(image.url(), self.today)
                );
            }
        } else {
            let mut pacer = Pacer::new(self.pacing, accepted.len());
            for image in &accepted {
                let outcome = self.process(image).await;
                report.record(outcome);
                pacer.after_item().await;
            }
        }

        self.enter(RunStage::Reporting);
        let rule = "=".repeat(SUMMARY_RULE_WIDTH);
        info!("{rule}");
        info!("run complete for {}", self.target);
        info!("{}", report.summary_line());
        info!("{rule}");
        self.enter(RunStage::Done);
        report
    }

    async fn collect(&mut self) -> Result<Vec<AcceptedImage>, RunError> {
        self.enter(RunStage::Fetching);
        debug!("fetching {} ({} mode)", self.target, self.fetcher.mode().label());
        let tree = self.fetcher.fetch(&self.target).await?;

        self.enter(RunStage::Extracting);
        let candidates = extract_candidates(&tree);
        info!(
            "{} image references in {} document(s), {} unique candidates",
            tree.image_count(),
            tree.documents().count(),
            candidates.len()
        );
        if candidates.is_empty() {
            return Err(RunError::ExtractionEmpty {
                stage: "extraction",
            });
        }

        self.enter(RunStage::Filtering);
        let accepted = self.filter.admit(candidates);
        if accepted.is_empty() {
            return Err(RunError::ExtractionEmpty { stage: "filtering" });
        }
        Ok(accepted)
    }

    async fn process(&mut self, image: &AcceptedImage) -> ItemOutcome {
        let url = image.url();

        self.enter(RunStage::Downloading);
        let download = match self.images.fetch(url).await {
            Ok(download) => download,
            Err(err) => {
                error!("[{}] {err}", self.stage.label());
                return ItemOutcome::Errored;
            }
        };

        self.enter(RunStage::Deciding);
        if let Err(reason) = self.filter.check_download(&download) {
            info!("skipped {url}: {reason}");
            return ItemOutcome::Skipped;
        }

        self.enter(RunStage::Persisting);
        let filename = filename_for(url, self.today);
        match self.sink.persist(&download.bytes, &filename).await {
            Ok(artifact) => {
                info!("saved {} -> {}", download.url, artifact.location());
                ItemOutcome::Downloaded
            }
            Err(err) => {
                error!("[{}] {url}: {err}", self.stage.label());
                ItemOutcome::Errored
            }
        }
    }

    fn enter(&mut self, stage: RunStage) {
        debug!("stage {} -> {}", self.stage.label(), stage.label());
        self.stage = stage;
    }
}

pub async fn run() -> io::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    init_logging(&settings.log_file, cli.verbose)?;
    info!(
        "imgrab {} starting: target={} mode={}",
        env!("CARGO_PKG_VERSION"),
        settings.target_url,
        settings.mode.label()
    );

    let sink = if settings.dry_run {
        Sink::Local(LocalSink::new(settings.output_dir.clone()))
    } else {
        Sink::select(&settings, Credentials::from_env()).await
    };
    info!("storing images in {}", sink.describe());

    let mut runner = Runner::from_settings(&settings, sink, Local::now().date_naive())?;
    let report = runner.run().await;
    if let Some(err) = &report.aborted {
        warn!("run aborted without summary: {err}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_bumps_exactly_one_counter() {
        let mut report = RunReport::default();
        report.record(ItemOutcome::Downloaded);
        report.record(ItemOutcome::Downloaded);
        report.record(ItemOutcome::Skipped);
        report.record(ItemOutcome::Errored);
        assert_eq!(report.summary_line(), "downloaded=2 skipped=1 errored=1");
        assert!(report.aborted.is_none());
    }

    #[test]
    fn aborted_report_has_zero_counters() {
        let report = RunReport::aborted(RunError::ExtractionEmpty {
            stage: "extraction",
        });
        assert_eq!(report.summary_line(), "downloaded=0 skipped=0 errored=0");
        assert!(matches!(
            report.aborted,
            Some(RunError::ExtractionEmpty { stage: "extraction" })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_pauses_between_items_only() {
        let interval = Duration::from_millis(1000);
        let start = tokio::time::Instant::now();
        let mut pacer = Pacer::new(interval, 4);
        for _ in 0..4 {
            pacer.after_item().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= interval * 3, "{elapsed:?}");
        assert!(elapsed < interval * 3 + interval / 2, "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn single_item_is_never_delayed() {
        let start = tokio::time::Instant::now();
        let mut pacer = Pacer::new(Duration::from_secs(5), 1);
        pacer.after_item().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn runner_starts_idle() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Runner::from_settings(
            &Settings::default(),
            Sink::Local(LocalSink::new(tmp.path())),
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        )
        .unwrap();
        assert_eq!(runner.stage(), RunStage::Idle);
    }
}
