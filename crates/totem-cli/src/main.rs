use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::Parser;
use totem_contracts::config::EngineConfig;
use totem_contracts::events::{new_session_id, SessionEventLog};
use totem_engine::{
    ChatOutcome, DryrunTransport, HttpTransport, RemoteTransport, Sender, SpiritStatus,
    WorkflowController,
};

#[derive(Debug, Parser)]
#[command(name = "totem", version, about = "Photo reading, spirit summoning, follow-up chat")]
struct Cli {
    /// Photograph of the subject.
    image: PathBuf,
    /// Name the reading addresses.
    #[arg(long)]
    name: String,
    /// Output directory for the session (events, spirit image).
    #[arg(long, default_value = "totem-out")]
    out: PathBuf,
    /// Also summon the guardian spirit image.
    #[arg(long)]
    spirit: bool,
    /// Ask follow-up questions from stdin after the reading.
    #[arg(long)]
    chat: bool,
    /// Run offline against the deterministic dryrun transport.
    #[arg(long)]
    dryrun: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("totem error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // The credential crosses the process boundary exactly once, here.
    let credential = std::env::var("GEMINI_API_KEY")
        .or_else(|_| std::env::var("GOOGLE_API_KEY"))
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    if credential.is_none() && !cli.dryrun {
        bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set (or pass --dryrun)");
    }

    let transport: Box<dyn RemoteTransport> = if cli.dryrun {
        Box::new(DryrunTransport)
    } else {
        Box::new(HttpTransport::new())
    };
    let session_id = new_session_id();
    let events = SessionEventLog::new(cli.out.join("events.jsonl"), &session_id);
    let mut controller = WorkflowController::new(
        EngineConfig::default(),
        credential.or_else(|| cli.dryrun.then(|| "dryrun".to_string())),
        transport,
        events,
    );

    let image_bytes = fs::read(&cli.image)
        .with_context(|| format!("failed reading {}", cli.image.display()))?;
    controller.start(&image_bytes, &cli.name)?;

    let status = controller.status();
    let analysis = status
        .analysis
        .context("analysis completed without a stored result")?;
    println!("{}\n", analysis.text);

    if cli.spirit {
        controller.summon_spirit()?;
        let status = controller.status();
        if status.spirit.status == SpiritStatus::Done {
            let image_path = cli.out.join("spirit.jpg");
            let data = status.spirit.image_data.unwrap_or_default();
            fs::write(&image_path, BASE64.decode(data.as_bytes())?)
                .with_context(|| format!("failed to write {}", image_path.display()))?;
            println!(
                "Summoned {} -> {}",
                status.spirit.caption.as_deref().unwrap_or("the spirit"),
                image_path.display()
            );
        }
    }

    if cli.chat {
        chat_loop(&mut controller)?;
    }

    Ok(())
}

fn chat_loop(controller: &mut WorkflowController) -> Result<()> {
    let stdin = io::stdin();
    loop {
        print!("you> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(());
        }
        let question = line.trim();
        if question.is_empty() || question == "/quit" {
            return Ok(());
        }
        match controller.ask(question)? {
            ChatOutcome::Ignored => continue,
            ChatOutcome::Answered | ChatOutcome::FallbackUsed(_) => {
                let status = controller.status();
                if let Some(answer) = status
                    .transcript
                    .iter()
                    .rev()
                    .find(|message| message.sender == Sender::Bot)
                {
                    println!("totem> {}", answer.text);
                }
                // Quota and billing notices are terminal for the session.
                if let Some(notice) = status.quota_notice.or(status.billing_notice) {
                    eprintln!("notice: {notice}");
                    return Ok(());
                }
            }
        }
    }
}
