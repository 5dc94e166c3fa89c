//! Line-oriented story REPL.
//!
//! Protocol:
//! - Lines starting with `#` are commands (new, regen, images, system, ...)
//! - Any other non-empty line is a player action
//! - Narrative is printed between `[STORY]` and a blank line
//! - Illustrations are printed as `[IMAGE] <url>` once they arrive

use story_core::{IllustrationEvent, RegenerateOutcome, StoryError, StoryTeller};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;

/// Options taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct HeadlessOptions {
    pub opening: Option<String>,
    pub guiding_instructions: Option<String>,
    pub no_images: bool,
}

/// Parse options from command line arguments. Unknown arguments are ignored.
pub fn parse_options_from_args(args: &[String]) -> HeadlessOptions {
    let mut options = HeadlessOptions::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--opening" => {
                if let Some(text) = args.get(i + 1) {
                    options.opening = Some(text.clone());
                    i += 1;
                }
            }
            "--system" => {
                if let Some(text) = args.get(i + 1) {
                    options.guiding_instructions = Some(text.clone());
                    i += 1;
                }
            }
            "--no-images" => options.no_images = true,
            _ => {}
        }
        i += 1;
    }

    options
}

/// A parsed `#` command.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Quit,
    New(Option<String>),
    Regen,
    Images(Option<bool>),
    System(String),
    History,
    Help,
    Unknown(String),
}

fn parse_command(line: &str) -> Command {
    let body = line.trim_start_matches('#').trim();
    let (name, rest) = match body.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (body, ""),
    };

    match name.to_lowercase().as_str() {
        "quit" | "exit" => Command::Quit,
        "new" => Command::New((!rest.is_empty()).then(|| rest.to_string())),
        "regen" | "regenerate" => Command::Regen,
        "images" => Command::Images(story_core::config::parse_flag(rest)),
        "system" => Command::System(rest.to_string()),
        "history" => Command::History,
        "help" => Command::Help,
        other => Command::Unknown(other.to_string()),
    }
}

fn print_narrative(text: &str) {
    println!("[STORY]");
    for para in text.split("\n\n") {
        println!("{para}");
    }
    println!();
}

fn print_help() {
    println!("[HELP]");
    println!("  #new [action]       - Start a new story, optionally with a first action");
    println!("  #regen              - Regenerate the latest illustration");
    println!("  #images on|off      - Toggle automatic illustration");
    println!("  #system <text>      - Replace the storyteller's guiding instructions");
    println!("  #history            - Show the story so far");
    println!("  #quit               - Exit");
    println!("  (anything else is sent as a player action)");
}

async fn submit(teller: &StoryTeller, action: &str) {
    match teller.submit_turn(action).await {
        Ok(outcome) => {
            print_narrative(&outcome.narrative);
            if outcome.illustration_pending {
                println!("[ILLUSTRATING]");
            }
        }
        Err(StoryError::EmptyInput) => {}
        Err(e) => println!("[ERROR] {e}"),
    }
}

fn print_image(event: &IllustrationEvent) {
    println!("[IMAGE] {}", event.reference);
}

/// What the REPL does after handling one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

async fn handle_line(teller: &StoryTeller, line: &str) -> Flow {
    let line = line.trim();
    if line.is_empty() {
        return Flow::Continue;
    }

    if !line.starts_with('#') {
        submit(teller, line).await;
        return Flow::Continue;
    }

    match parse_command(line) {
        Command::Quit => return Flow::Quit,
        Command::New(first_action) => match teller.start_new_story(first_action.as_deref()).await {
            Ok(Some(outcome)) => {
                println!("[NEW STORY]");
                print_narrative(&outcome.narrative);
            }
            Ok(None) => println!("[NEW STORY]"),
            Err(e) => println!("[ERROR] {e}"),
        },
        Command::Regen => {
            println!("[ILLUSTRATING]");
            match teller.regenerate_last_illustration().await {
                // Printed from the illustration events
                Ok(RegenerateOutcome::Illustrated { .. }) => {}
                Ok(RegenerateOutcome::NoAssistantTurn) => {
                    println!("[ERROR] Nothing to illustrate yet")
                }
                Ok(RegenerateOutcome::Stale { .. }) => {
                    println!("[ERROR] The story was reset before the image arrived")
                }
                Ok(RegenerateOutcome::Failed { reason, .. }) => {
                    println!("[ERROR] Illustration failed: {reason}")
                }
                Err(e) => println!("[ERROR] {e}"),
            }
        }
        Command::Images(Some(enabled)) => {
            teller.set_auto_illustrate(enabled).await;
            println!("[OK] Illustrations {}", if enabled { "on" } else { "off" });
        }
        Command::Images(None) => println!("[ERROR] Usage: #images on|off"),
        Command::System(text) if text.is_empty() => {
            println!("[SYSTEM]");
            println!("{}", teller.config().await.guiding_instructions);
        }
        Command::System(text) => {
            teller.set_guiding_instructions(text).await;
            println!("[OK] Guiding instructions updated");
        }
        Command::History => {
            for turn in teller.turns().await {
                println!("[{}] {}", turn.speaker.as_str().to_uppercase(), turn.text);
                if let Some(image) = &turn.illustration {
                    println!("  [IMAGE] {image}");
                }
            }
        }
        Command::Help => print_help(),
        Command::Unknown(name) => {
            println!("[ERROR] Unknown command #{name}. Type #help for help.")
        }
    }

    Flow::Continue
}

/// Print whatever illustrations are already queued without waiting.
fn drain_images(images: &mut Receiver<IllustrationEvent>) {
    loop {
        match images.try_recv() {
            Ok(event) => print_image(&event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
}

/// Run the REPL until `#quit` or end of input, then wait for pending
/// illustrations.
///
/// Illustrations are printed as soon as they attach, even while the REPL
/// is waiting for the next line.
pub async fn run_headless(teller: StoryTeller, options: HeadlessOptions) -> anyhow::Result<()> {
    let config = teller.config().await;
    let mut images = teller.subscribe_illustrations();

    println!("=== Illustrated Story ===");
    println!(
        "Illustrations: {}",
        if config.auto_illustrate { "on" } else { "off" }
    );
    println!();
    print_help();
    println!();

    if let Some(opening) = options.opening.as_deref() {
        submit(&teller, opening).await;
    }

    let mut lines = BufReader::new(io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if handle_line(&teller, &line).await == Flow::Quit {
                    break;
                }
            }
            event = images.recv() => match event {
                Ok(event) => print_image(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "illustration events dropped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    teller.wait_for_illustrations().await;
    drain_images(&mut images);

    println!("Goodbye!");
    Ok(())
}
