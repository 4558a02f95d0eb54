use glam::DVec3;
use tempfile::TempDir;

use super::*;
use crate::config::PipelineConfig;
use crate::testing::{batch_in, EngineScript, FakeEngine, FakeTrainer, FixedReviewer};

struct Fixture {
    dir: TempDir,
    env: Arc<Environment>,
    engine: Arc<FakeEngine>,
    trainer: Arc<FakeTrainer>,
}

impl Fixture {
    fn new(config: PipelineConfig) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let env = Arc::new(Environment::open(dir.path().join("env"), config)?);
        Ok(Self {
            dir,
            env,
            engine: Arc::new(FakeEngine::default()),
            trainer: Arc::new(FakeTrainer::default()),
        })
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.env.clone(), self.engine.clone(), self.trainer.clone())
    }

    fn batch(&self, name: &str, count: usize, hint: Option<DVec3>) -> anyhow::Result<Batch> {
        Ok(batch_in(&self.dir.path().join(name), count, hint)?)
    }

    /// Commits `count` images laid out on a grid around (1, 1, z).
    async fn bootstrap(&self, count: usize) -> anyhow::Result<MergeRecord> {
        let batch = self.batch("bootstrap", count, None)?;
        self.engine.place_all(batch.images.iter(), grid);
        let outcome = self.pipeline().run(batch).await?;
        Ok(outcome.into_result()?)
    }
}

fn grid(index: usize) -> DVec3 {
    DVec3::new((index % 3) as f64, (index / 3 % 3) as f64, (index / 9) as f64 * 0.5)
}

fn near_center(index: usize) -> DVec3 {
    DVec3::new(0.5 + 0.1 * index as f64, 1.2, 0.7)
}

const CENTER: DVec3 = DVec3::new(1.0, 1.0, 1.0);

#[tokio::test]
async fn first_batch_bootstraps_main() -> anyhow::Result<()> {
    let f = Fixture::new(PipelineConfig::default())?;

    let record = f.bootstrap(10).await?;

    let main = f.env.snapshot();
    assert_eq!(record.added.len(), 10);
    assert_eq!(main.dataset.len(), 10);
    assert_eq!(main.poses.len(), 10);
    assert_eq!(main.catalog.resolved_groups().count(), 1);
    assert_eq!(f.engine.calls(), 1);
    assert_eq!(f.trainer.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn expansion_stages_neighbors_with_batch() -> anyhow::Result<()> {
    let f = Fixture::new(PipelineConfig::default())?;
    f.bootstrap(50).await?;

    let batch = f.batch("second", 10, Some(CENTER))?;
    f.engine.place_all(batch.images.iter(), near_center);
    let outcome = f.pipeline().run(batch).await?;

    assert_eq!(outcome.state(), AttemptState::Merged);
    assert_eq!(outcome.staging.dataset.neighbors().len(), 20);
    assert_eq!(outcome.staging.dataset.input_len(), 30);
    assert!(!outcome.staging_dir().exists());

    let main = f.env.snapshot();
    assert_eq!(main.dataset.len(), 60);
    assert_eq!(main.poses.len(), 60);
    assert_eq!(main.catalog.len(), 1);
    assert_eq!(main.merges.len(), 2);
    Ok(())
}

#[tokio::test]
async fn low_recovery_is_rejected_and_main_unchanged() -> anyhow::Result<()> {
    let f = Fixture::new(PipelineConfig::default())?;
    f.bootstrap(10).await?;
    let before = f.env.snapshot();

    let batch = f.batch("second", 10, Some(CENTER))?;
    f.engine.place_all(batch.images.iter().take(6), near_center);
    let outcome = f.pipeline().run(batch).await?;

    assert_eq!(outcome.state(), AttemptState::Rejected);
    assert!(!outcome.is_merged());
    let record = outcome.merge.clone().unwrap();
    assert_eq!(record.outcome, MergeOutcome::Rejected);
    assert_eq!(record.verdict, Verdict::Reject);
    assert!(record.reason.as_deref().unwrap().contains("recovered 6 of 10"));

    let main = f.env.snapshot();
    assert_eq!(main.dataset, before.dataset);
    assert_eq!(main.poses, before.poses);
    assert_eq!(main.catalog, before.catalog);
    assert_eq!(main.merges.last(), Some(&record));

    assert!(matches!(outcome.into_result(), Err(Error::QualityRejected { .. })));
    Ok(())
}

#[tokio::test]
async fn distant_batch_fails_before_any_job() -> anyhow::Result<()> {
    let f = Fixture::new(PipelineConfig::default())?;
    f.bootstrap(10).await?;

    let batch = f.batch("far", 5, Some(DVec3::new(500.0, 0.0, 0.0)))?;
    let result = f.pipeline().run(batch).await;

    assert!(matches!(result, Err(Error::NoRelevantGroup { .. })));
    assert_eq!(f.engine.calls(), 1);
    assert!(std::fs::read_dir(f.env.staging_dir())?.next().is_none());
    Ok(())
}

#[tokio::test]
async fn oversized_batch_is_refused() -> anyhow::Result<()> {
    let f = Fixture::new(PipelineConfig {
        staging_size_cap: 5,
        ..Default::default()
    })?;

    let batch = f.batch("big", 6, None)?;
    let result = f.pipeline().run(batch).await;

    assert!(matches!(result, Err(Error::BatchTooLarge { count: 6, cap: 5 })));
    assert_eq!(f.engine.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn empty_batch_is_refused() -> anyhow::Result<()> {
    let f = Fixture::new(PipelineConfig::default())?;
    let result = f.pipeline().run(Batch::default()).await;
    assert!(matches!(result, Err(Error::EmptyBatch)));
    Ok(())
}

#[tokio::test]
async fn job_timeout_fails_attempt() -> anyhow::Result<()> {
    let f = Fixture::new(PipelineConfig {
        timeout_seconds: 1,
        ..Default::default()
    })?;
    f.engine.set_script(EngineScript::Hang);

    let outcome = f.pipeline().run(f.batch("first", 3, None)?).await?;

    assert_eq!(outcome.state(), AttemptState::ReconstructionFailed);
    assert!(outcome.merge.is_none());
    assert!(outcome.staging_dir().is_dir());
    assert!(f.env.snapshot().is_empty());
    assert!(matches!(
        outcome.into_result(),
        Err(Error::ReconstructionFailed { reason, .. }) if reason.contains("did not finish")
    ));
    Ok(())
}

#[tokio::test]
async fn cancelled_run_fails_attempt() -> anyhow::Result<()> {
    let f = Fixture::new(PipelineConfig::default())?;
    f.engine.set_script(EngineScript::Hang);
    let cancel = CancelToken::new();
    cancel.cancel();

    let outcome = f
        .pipeline()
        .run_with_cancel(f.batch("first", 3, None)?, &cancel)
        .await?;

    assert_eq!(outcome.state(), AttemptState::ReconstructionFailed);
    Ok(())
}

#[tokio::test]
async fn training_failure_leaves_main_alone() -> anyhow::Result<()> {
    let f = Fixture::new(PipelineConfig::default())?;
    let trainer = Arc::new(FakeTrainer::failing());
    let batch = f.batch("first", 3, None)?;
    f.engine.place_all(batch.images.iter(), grid);

    let pipeline = Pipeline::new(f.env.clone(), f.engine.clone(), trainer);
    let outcome = pipeline.run(batch).await?;

    assert_eq!(outcome.state(), AttemptState::TrainingFailed);
    assert!(f.env.snapshot().is_empty());
    assert!(matches!(outcome.into_result(), Err(Error::TrainingFailed { .. })));
    Ok(())
}

#[tokio::test]
async fn manual_gate_asks_reviewer() -> anyhow::Result<()> {
    let f = Fixture::new(PipelineConfig {
        gate_mode: GateMode::Manual,
        ..Default::default()
    })?;
    let reviewer = Arc::new(FixedReviewer::new(ReviewDecision::Reject("too dark".to_string())));

    let first = f.batch("first", 10, None)?;
    f.engine.place_all(first.images.iter(), grid);
    let pipeline = f.pipeline().with_reviewer(reviewer.clone());
    pipeline.run(first).await?.into_result()?;
    // bootstrap never waits for review
    assert_eq!(reviewer.calls(), 0);

    let batch = f.batch("second", 4, Some(CENTER))?;
    f.engine.place_all(batch.images.iter(), near_center);
    let outcome = pipeline.run(batch).await?;

    assert_eq!(reviewer.calls(), 1);
    assert_eq!(outcome.state(), AttemptState::Rejected);
    let record = outcome.merge.unwrap();
    assert_eq!(record.verdict, Verdict::NeedsReview);
    assert_eq!(record.review, Some(ReviewDecision::Reject("too dark".to_string())));
    assert_eq!(record.reason.as_deref(), Some("too dark"));
    assert_eq!(f.env.snapshot().dataset.len(), 10);
    Ok(())
}

#[tokio::test]
async fn assisted_gate_commits_on_approval() -> anyhow::Result<()> {
    let f = Fixture::new(PipelineConfig {
        gate_mode: GateMode::Assisted,
        ..Default::default()
    })?;
    let reviewer = Arc::new(FixedReviewer::new(ReviewDecision::Accept));
    let pipeline = f.pipeline().with_reviewer(reviewer.clone());

    let first = f.batch("first", 10, None)?;
    f.engine.place_all(first.images.iter(), grid);
    pipeline.run(first).await?.into_result()?;

    let batch = f.batch("second", 4, Some(CENTER))?;
    f.engine.place_all(batch.images.iter(), near_center);
    let record = pipeline.run(batch).await?.into_result()?;

    assert_eq!(reviewer.calls(), 1);
    assert_eq!(record.review, Some(ReviewDecision::Accept));
    assert_eq!(f.env.snapshot().dataset.len(), 14);
    Ok(())
}

#[tokio::test]
async fn reviewed_gate_needs_reviewer() -> anyhow::Result<()> {
    let f = Fixture::new(PipelineConfig {
        gate_mode: GateMode::Manual,
        ..Default::default()
    })?;

    let result = f.pipeline().run(f.batch("first", 2, None)?).await;

    assert!(matches!(result, Err(Error::InvalidConfig(_))));
    assert_eq!(f.engine.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn busy_region_is_refused() -> anyhow::Result<()> {
    let f = Fixture::new(PipelineConfig::default())?;
    let _claim = f.env.claim(Region::Bootstrap)?;

    let result = f.pipeline().run(f.batch("first", 2, None)?).await;

    assert!(matches!(result, Err(Error::RegionBusy(Region::Bootstrap))));
    assert_eq!(f.engine.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn halted_pipeline_refuses_batches() -> anyhow::Result<()> {
    let f = Fixture::new(PipelineConfig::default())?;
    f.env.halt("test");

    let result = f.pipeline().run(f.batch("first", 2, None)?).await;
    assert!(matches!(result, Err(Error::Halted)));

    f.env.clear_halt()?;
    let batch = f.batch("again", 2, None)?;
    f.engine.place_all(batch.images.iter(), grid);
    assert!(f.pipeline().run(batch).await?.is_merged());
    Ok(())
}

#[tokio::test]
async fn subscribers_see_every_record() -> anyhow::Result<()> {
    let f = Fixture::new(PipelineConfig::default())?;
    let mut events = f.env.subscribe();

    let record = f.bootstrap(5).await?;

    assert_eq!(events.recv().await?, record);
    Ok(())
}
