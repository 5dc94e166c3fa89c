//! Integration tests that call real LM Studio and ComfyUI servers.
//!
//! These tests need a model loaded in LM Studio and, for the illustration
//! tests, a ComfyUI instance with the configured checkpoint. Endpoints come
//! from the environment (via .env file or environment).
//! Run with: `cargo test -p story-core --test live_servers -- --ignored --nocapture`
//!
//! These are marked #[ignore] by default to avoid:
//! - Test failures when no local server is running
//! - Slow test runs (generation takes seconds to minutes)

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use story_core::{
    ComfyUiIllustrator, IllustrationService, LmStudioNarrator, NarrativeService,
    RegenerateOutcome, Speaker, StoryConfig, StoryTeller,
};

/// Load environment variables from .env file
fn setup() {
    let _ = dotenvy::dotenv();
}

fn narrator() -> LmStudioNarrator {
    LmStudioNarrator::new(lmstudio::LmStudio::from_env().expect("Failed to create LM Studio client"))
}

fn illustrator() -> ComfyUiIllustrator {
    let client = comfyui::ComfyUi::from_env()
        .expect("Failed to create ComfyUI client")
        .with_completion_timeout(Duration::from_secs(600));
    ComfyUiIllustrator::new(client)
}

async fn lmstudio_available() -> bool {
    match lmstudio::LmStudio::from_env() {
        Ok(client) => client.models().await.is_ok(),
        Err(_) => false,
    }
}

#[tokio::test]
#[ignore]
async fn test_lmstudio_lists_models() {
    setup();
    if !lmstudio_available().await {
        eprintln!("Skipping test: LM Studio not reachable");
        return;
    }

    let models = narrator().client().models().await.expect("models");
    println!("Loaded models: {models:?}");
}

#[tokio::test]
#[ignore]
async fn test_narrator_continues_story() {
    setup();
    if !lmstudio_available().await {
        eprintln!("Skipping test: LM Studio not reachable");
        return;
    }

    let reply = narrator()
        .continue_story(
            &[],
            "I step into an abandoned lighthouse",
            story_core::DEFAULT_GUIDING_INSTRUCTIONS,
        )
        .await
        .expect("narrator should respond");

    println!("Raw reply:\n{reply}");
    let parsed = story_core::parse_story_response(&reply);
    assert!(!parsed.narrative.is_empty(), "narrative should not be empty");
}

#[tokio::test]
#[ignore]
async fn test_lmstudio_streams_story() {
    setup();
    if !lmstudio_available().await {
        eprintln!("Skipping test: LM Studio not reachable");
        return;
    }

    let request = lmstudio::Request::new(vec![
        lmstudio::Message::system(story_core::DEFAULT_GUIDING_INSTRUCTIONS),
        lmstudio::Message::user("I wake in a snowed-in cabin"),
    ])
    .with_max_tokens(200);

    let mut stream = narrator().client().stream(request).await.expect("stream");
    let mut text = String::new();
    let mut done = false;
    while let Some(event) = stream.next().await {
        match event.expect("stream event") {
            lmstudio::StreamEvent::TextDelta(delta) => text.push_str(&delta),
            lmstudio::StreamEvent::Done => {
                done = true;
                break;
            }
        }
    }

    println!("Streamed:\n{text}");
    assert!(done, "stream should end with [DONE]");
    assert!(!text.trim().is_empty());
}

#[tokio::test]
#[ignore]
async fn test_narrator_synthesizes_directive() {
    setup();
    if !lmstudio_available().await {
        eprintln!("Skipping test: LM Studio not reachable");
        return;
    }

    let directive = narrator()
        .synthesize_illustration_directive("Rain lashes the deck as the ship heels into the wind.")
        .await
        .expect("directive");
    println!("Directive: {directive}");
    assert!(!directive.trim().is_empty());
}

#[tokio::test]
#[ignore]
async fn test_comfyui_generates_image() {
    setup();

    match illustrator()
        .generate_illustration("a lighthouse on a cliff at sunset, oil painting")
        .await
    {
        Ok(reference) => {
            println!("Image: {reference}");
            assert!(reference.as_str().contains("/view?"));
        }
        Err(e) => eprintln!("Skipping test: ComfyUI not usable: {e}"),
    }
}

#[tokio::test]
#[ignore]
async fn test_full_turn_with_illustration() {
    setup();
    if !lmstudio_available().await {
        eprintln!("Skipping test: LM Studio not reachable");
        return;
    }

    let teller = StoryTeller::new(
        StoryConfig::from_env(),
        Arc::new(narrator()),
        Arc::new(illustrator()),
    )
    .expect("markers compile");

    let outcome = teller
        .submit_turn("I push open the creaking tavern door")
        .await
        .expect("submit");
    println!("Narrative:\n{}", outcome.narrative);
    assert!(!outcome.narrative_failed);

    teller.wait_for_illustrations().await;
    let turns = teller.turns().await;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].speaker, Speaker::Assistant);
    println!("Illustration: {:?}", turns[1].illustration);

    match teller.regenerate_last_illustration().await.expect("regenerate") {
        RegenerateOutcome::Illustrated { reference, .. } => println!("Regenerated: {reference}"),
        other => println!("Regeneration did not produce an image: {other:?}"),
    }
}
