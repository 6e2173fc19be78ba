mod common;

use std::time::Duration;

use chapterflow::WorkflowError;
use chapterflow::adapters::{AdapterError, GenerationMode};
use chapterflow::config::WorkflowConfig;
use chapterflow::error::RetryScope;
use chapterflow::model::{Decision, Phase, ReviewPayload};
use chapterflow::store::ContentStore as _;
use common::{ScriptedGenerator, StaticScraper, Step, fast_config, harness, harness_with};

const URL: &str = "https://example.com/chapters/storm";

#[tokio::test]
async fn always_failing_draft_abandons_after_max_attempts() -> anyhow::Result<()> {
    let generator = ScriptedGenerator::default();
    generator.fail_always(
        GenerationMode::Draft,
        AdapterError::Transient("503 from upstream".to_owned()),
    );
    let h = harness_with(fast_config(), StaticScraper::default(), generator).await?;

    let err = h.engine.process(URL).await.unwrap_err();
    assert!(err.is_abandonment(), "{err}");
    match &err {
        WorkflowError::RetryLimitExceeded {
            scope, attempts, ..
        } => {
            assert_eq!(*scope, RetryScope::Phase(Phase::Drafted));
            assert_eq!(*attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.generator.calls(GenerationMode::Draft).len(), 3);

    let chapter = h.engine.list_chapters().await?.remove(0);
    assert_eq!(chapter.state(), Phase::Abandoned);
    assert!(
        chapter
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("503 from upstream"))
    );
    let history = h.store.get_history(&chapter.id).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].phase, Phase::Raw);

    let err = h.engine.advance(&chapter.id).await.unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { .. }), "{err}");
    Ok(())
}

#[tokio::test]
async fn timeouts_and_bad_output_are_retried_within_budget() -> anyhow::Result<()> {
    let h = harness(WorkflowConfig {
        adapter_timeout_ms: 50,
        ..fast_config()
    })
    .await?;
    h.generator
        .push(GenerationMode::Draft, Step::Reply("   ".to_owned()));
    h.generator.push(
        GenerationMode::Spin,
        Step::Stall(Duration::from_millis(500)),
    );
    h.generator
        .push(GenerationMode::Review, Step::Reply("Looks fine to me.".to_owned()));

    let chapter = h.engine.process(URL).await?;
    assert_eq!(chapter.state(), Phase::HumanReviewPending);
    assert!(chapter.phase_attempts.is_empty());
    assert_eq!(chapter.last_error, None);

    assert_eq!(h.generator.calls(GenerationMode::Draft).len(), 2);
    assert_eq!(h.generator.calls(GenerationMode::Spin).len(), 2);
    assert_eq!(h.generator.calls(GenerationMode::Review).len(), 2);

    let history = h.store.get_history(&chapter.id).await?;
    assert_eq!(history.len(), 4);
    assert_eq!(history[1].metadata["attempts"], serde_json::json!(2));
    assert_eq!(history[2].metadata["attempts"], serde_json::json!(2));
    Ok(())
}

#[tokio::test]
async fn fatal_errors_are_not_retried_locally_but_still_count() -> anyhow::Result<()> {
    let generator = ScriptedGenerator::default();
    generator.fail_always(
        GenerationMode::Spin,
        AdapterError::Fatal("401 unauthorized".to_owned()),
    );
    let h = harness_with(fast_config(), StaticScraper::default(), generator).await?;

    let err = h.engine.process(URL).await.unwrap_err();
    assert!(
        matches!(err, WorkflowError::AdapterFailed { phase: Phase::Spun, .. }),
        "{err}"
    );
    assert!(!err.is_abandonment());
    assert_eq!(h.generator.calls(GenerationMode::Spin).len(), 1);

    let chapter = h.engine.list_chapters().await?.remove(0);
    assert_eq!(chapter.state(), Phase::Drafted);
    assert_eq!(chapter.attempts(Phase::Spun), 1);

    let err = h.engine.advance(&chapter.id).await.unwrap_err();
    assert!(matches!(err, WorkflowError::AdapterFailed { .. }), "{err}");
    let err = h.engine.advance(&chapter.id).await.unwrap_err();
    assert!(err.is_abandonment(), "{err}");

    assert_eq!(h.generator.calls(GenerationMode::Spin).len(), 3);
    assert_eq!(h.engine.chapter(&chapter.id).await?.state(), Phase::Abandoned);
    Ok(())
}

#[tokio::test]
async fn failed_summary_never_blocks_the_draft() -> anyhow::Result<()> {
    let generator = ScriptedGenerator::default();
    generator.fail_always(
        GenerationMode::Summarize,
        AdapterError::Transient("overloaded".to_owned()),
    );
    let h = harness_with(fast_config(), StaticScraper::default(), generator).await?;

    let chapter = h.engine.process(URL).await?;
    assert_eq!(chapter.state(), Phase::HumanReviewPending);
    assert!(chapter.themes.is_empty());
    assert_eq!(h.generator.calls(GenerationMode::Draft).len(), 1);
    Ok(())
}

#[tokio::test]
async fn scrape_failures_leave_no_chapter_behind() -> anyhow::Result<()> {
    let h = harness_with(
        fast_config(),
        StaticScraper::failing(AdapterError::Transient("connection reset".to_owned())),
        ScriptedGenerator::default(),
    )
    .await?;
    let err = h.engine.process(URL).await.unwrap_err();
    assert!(
        matches!(
            &err,
            WorkflowError::RetryLimitExceeded { subject, attempts: 3, .. } if subject == URL
        ),
        "{err}"
    );
    assert!(!err.is_abandonment());
    assert_eq!(h.scraper.calls(), 3);
    assert!(h.engine.list_chapters().await?.is_empty());

    let h = harness_with(
        fast_config(),
        StaticScraper::failing(AdapterError::Fatal("404 Not Found".to_owned())),
        ScriptedGenerator::default(),
    )
    .await?;
    let err = h.engine.process(URL).await.unwrap_err();
    assert!(
        matches!(err, WorkflowError::AdapterFailed { phase: Phase::Raw, .. }),
        "{err}"
    );
    assert_eq!(h.scraper.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn rejections_reenter_until_the_limit_then_abandon() -> anyhow::Result<()> {
    let h = harness(fast_config()).await?;
    let chapter = h.engine.process(URL).await?;

    for round in 1..=2 {
        let request = h.engine.pending_reviews().await?.remove(0);
        let rejected = h
            .engine
            .submit_human_decision(
                &request.id,
                Decision::Reject { reenter_at: None },
                ReviewPayload {
                    feedback: Some(format!("round {round}: tighten the prose")),
                    ..ReviewPayload::default()
                },
            )
            .await?;
        assert_eq!(rejected.rejections, round);
        assert_eq!(rejected.reentry, Some(Phase::Spun));

        let resumed = h.engine.run_until_suspended(&chapter.id).await?;
        assert_eq!(resumed.state(), Phase::HumanReviewPending);
    }

    let request = h.engine.pending_reviews().await?.remove(0);
    let abandoned = h
        .engine
        .submit_human_decision(
            &request.id,
            Decision::Reject { reenter_at: None },
            ReviewPayload::default(),
        )
        .await?;
    assert_eq!(abandoned.state(), Phase::Abandoned);
    assert_eq!(abandoned.rejections, 3);
    assert!(
        abandoned
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("human rejections"))
    );
    assert!(h.engine.pending_reviews().await?.is_empty());

    // RAW, DRAFTED, then SPUN + AI_REVIEWED for each of the three reviews.
    assert_eq!(h.store.get_history(&chapter.id).await?.len(), 8);
    let settled = h.engine.run_until_suspended(&chapter.id).await?;
    assert_eq!(settled.state(), Phase::Abandoned);
    Ok(())
}
