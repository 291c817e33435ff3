use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reverie_contracts::accounts::{hash_password, AccountStore, AppSettings};
use reverie_contracts::console::{parse_intent, SESSION_HELP_COMMANDS};
use reverie_contracts::events::SessionEventWriter;
use reverie_contracts::facts::{fact_for_tick, fact_rotates_at};
use reverie_contracts::quota::{QuotaLedger, DEFAULT_IMAGE_LIMIT};
use reverie_contracts::session::{Session, SessionState, DREAM_TEXT_MAX_CHARS};
use reverie_engine::{
    mime_for_path, non_empty_env, timestamp_millis, DryrunMailer, DryrunStudio, HttpTranslator,
    LeonardoClient, NoopTranslator, ReferenceUpload, SmtpMailer, Translator, Workflow,
    WorkflowParts,
};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "reverie", version, about = "Dream-to-image session console")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run an interactive dream-image session.
    Session(SessionArgs),
    /// Print the salted password hash for a settings account entry.
    HashPassword(HashPasswordArgs),
}

#[derive(Debug, Parser)]
struct SessionArgs {
    #[arg(long)]
    settings: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Use in-process stand-ins for the generator, translator and mailer.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    poll_interval: Option<u64>,
    #[arg(long)]
    poll_timeout: Option<u64>,
}

#[derive(Debug, Parser)]
struct HashPasswordArgs {
    #[arg(long)]
    salt: String,
    #[arg(long)]
    password: String,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("reverie error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Session(args) => run_session(args),
        Command::HashPassword(args) => {
            println!("{}", hash_password(&args.salt, &args.password));
            Ok(0)
        }
    }
}

fn run_session(args: SessionArgs) -> Result<i32> {
    let mut settings = AppSettings::load(&args.settings)?;
    if let Some(interval) = args.poll_interval {
        settings.polling.interval_secs = interval;
    }
    if let Some(timeout) = args.poll_timeout {
        settings.polling.timeout_secs = timeout;
    }
    settings.validate()?;
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;

    let mut session = Session::new();
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let events = SessionEventWriter::new(events_path, session.session_id().to_string());
    let workflow = build_workflow(&settings, events, &args)?;

    println!("Reverie session console. Type /help for commands.");

    let stdin = io::stdin();
    let mut line = String::new();
    let mut dream_text = String::new();
    let mut reference_path: Option<PathBuf> = None;

    loop {
        if session.state() == SessionState::LoggedOut {
            let Some(username) = read_line(&stdin, &mut line, "username: ")? else {
                break;
            };
            let username = username.trim().to_string();
            if username.is_empty() {
                continue;
            }
            let Some(password) = read_line(&stdin, &mut line, "password: ")? else {
                break;
            };
            match workflow.login(&mut session, &username, &password) {
                Ok(()) => {
                    match workflow.remaining_generations(&session.username) {
                        Some(remaining) => println!(
                            "Welcome, {}. {remaining} generation(s) left.",
                            session.username
                        ),
                        None => println!("Welcome, {}.", session.username),
                    }
                    println!("Describe your dream (up to {DREAM_TEXT_MAX_CHARS} characters), then /generate.");
                }
                Err(err) => println!("{err}"),
            }
            continue;
        }

        let prompt = match session.state() {
            SessionState::ShowCandidates => "choose> ",
            SessionState::Success => "done> ",
            _ => "> ",
        };
        let Some(input) = read_line(&stdin, &mut line, prompt)? else {
            break;
        };
        let intent = parse_intent(&input);
        match intent.action.as_str() {
            "noop" => {}
            "help" => println!("Commands: {}", SESSION_HELP_COMMANDS.join(" ")),
            "show_quota" => match workflow.remaining_generations(&session.username) {
                Some(remaining) => println!("{}: {remaining} generation(s) left.", session.username),
                None => println!("{}: unlimited generations.", session.username),
            },
            "set_dream" => {
                if session.state() != SessionState::Main {
                    println!("Finish or /restart the current cycle before a new dream.");
                    continue;
                }
                let text = intent.prompt.unwrap_or_default();
                let chars = text.chars().count();
                if chars > DREAM_TEXT_MAX_CHARS {
                    println!(
                        "Keep the dream under {DREAM_TEXT_MAX_CHARS} characters ({chars} given)."
                    );
                    continue;
                }
                dream_text = text;
                println!("Dream noted. /generate when ready.");
            }
            "set_reference" => {
                let path = intent
                    .command_args
                    .get("path")
                    .and_then(Value::as_str)
                    .map(PathBuf::from)
                    .filter(|value| !value.as_os_str().is_empty());
                let Some(path) = path else {
                    println!("/image requires a path");
                    continue;
                };
                if !path.exists() {
                    println!("Reference image not found ({})", path.display());
                    continue;
                }
                match mime_for_path(&path) {
                    Ok(_) => {
                        println!("Reference image set to {}", path.display());
                        reference_path = Some(path);
                    }
                    Err(err) => println!("{err}"),
                }
            }
            "clear_reference" => {
                reference_path = None;
                println!("Reference image cleared.");
            }
            "generate" => {
                if session.state() != SessionState::Main {
                    println!("Finish or /restart the current cycle first.");
                    continue;
                }
                let reference = match load_reference(reference_path.as_deref()) {
                    Ok(reference) => reference,
                    Err(err) => {
                        println!("{err:#}");
                        continue;
                    }
                };
                println!("Generating your dream image...");
                let outcome = workflow.submit_dream(&mut session, &dream_text, reference, &mut |progress| {
                    if fact_rotates_at(progress.tick) {
                        println!("  {}", fact_for_tick(progress.tick));
                    }
                });
                match outcome {
                    Ok(()) => match write_candidates(&args.out, &session) {
                        Ok(paths) => {
                            println!("Pick a candidate with /select 1-{}:", paths.len());
                            for (index, path) in paths.iter().enumerate() {
                                println!("  [{}] {}", index + 1, path.display());
                            }
                        }
                        Err(err) => println!("Failed to write candidates: {err:#}"),
                    },
                    Err(err) => println!("{err}"),
                }
            }
            "select_candidate" => {
                let index = intent
                    .command_args
                    .get("index")
                    .and_then(Value::as_u64)
                    .and_then(|value| usize::try_from(value).ok())
                    .and_then(|value| value.checked_sub(1));
                let Some(index) = index else {
                    println!("/select requires a candidate number, e.g. /select 2");
                    continue;
                };
                match workflow.select_candidate(&mut session, index) {
                    Ok(()) => {
                        println!("The image and prompt were emailed. Thanks for dreaming with us.")
                    }
                    Err(err) => println!("{err}"),
                }
            }
            "start_over" => match workflow.start_over(&mut session) {
                Ok(()) => {
                    dream_text.clear();
                    reference_path = None;
                    println!("Starting over.");
                }
                Err(err) => println!("{err}"),
            },
            "logout" => match workflow.logout(&mut session) {
                Ok(()) => {
                    dream_text.clear();
                    reference_path = None;
                    println!("Logged out.");
                }
                Err(err) => println!("{err}"),
            },
            "unknown" => {
                let command = intent
                    .command_args
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                println!("Unknown command /{command}; /help lists commands.");
            }
            _ => {}
        }
    }

    Ok(0)
}

fn build_workflow(
    settings: &AppSettings,
    events: SessionEventWriter,
    args: &SessionArgs,
) -> Result<Workflow> {
    let accounts = AccountStore::new(settings.accounts.clone());
    let quota = QuotaLedger::new(DEFAULT_IMAGE_LIMIT, settings.privileged_users.clone());

    if args.dry_run {
        return Ok(Workflow::new(WorkflowParts {
            accounts,
            quota,
            events,
            translator: Some(Box::new(NoopTranslator)),
            preparer: Box::new(DryrunStudio::new()),
            generator: Box::new(DryrunStudio::new()),
            fetcher: Box::new(DryrunStudio::new()),
            mailer: Box::new(DryrunMailer::new(args.out.join("outbox"))?),
            style: settings.style.clone(),
            mail: settings.mail.clone(),
            polling: settings.polling,
        }));
    }

    let Some(client) = LeonardoClient::from_env() else {
        bail!("LEONARDO_API_KEY is not set (use --dry-run to run offline)");
    };
    let Some(smtp_password) = non_empty_env("REVERIE_SMTP_PASSWORD") else {
        bail!("REVERIE_SMTP_PASSWORD is not set (use --dry-run to run offline)");
    };
    let translator: Option<Box<dyn Translator>> = HttpTranslator::from_env(&settings.translation)
        .map(|translator| Box::new(translator) as Box<dyn Translator>);

    Ok(Workflow::new(WorkflowParts {
        accounts,
        quota,
        events,
        translator,
        preparer: Box::new(client.clone()),
        generator: Box::new(client.clone()),
        fetcher: Box::new(client),
        mailer: Box::new(SmtpMailer::new(settings.mail.clone(), smtp_password)),
        style: settings.style.clone(),
        mail: settings.mail.clone(),
        polling: settings.polling,
    }))
}

fn load_reference(path: Option<&Path>) -> Result<Option<ReferenceUpload>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let mime = mime_for_path(path).map_err(|err| anyhow::anyhow!("{err}"))?;
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Some(ReferenceUpload {
        bytes,
        mime: mime.to_string(),
    }))
}

fn write_candidates(out_dir: &Path, session: &Session) -> Result<Vec<PathBuf>> {
    let dir = out_dir.join(format!("session-{}", session.session_id()));
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let stamp = timestamp_millis();
    let mut paths = Vec::new();
    for (index, candidate) in session.candidates.iter().enumerate() {
        let path = dir.join(format!("candidate-{stamp}-{index:02}.png"));
        fs::write(&path, &candidate.bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        paths.push(path);
    }
    Ok(paths)
}

fn read_line(stdin: &io::Stdin, buffer: &mut String, prompt: &str) -> Result<Option<String>> {
    print!("{prompt}");
    io::stdout().flush()?;
    buffer.clear();
    let read = match stdin.read_line(buffer) {
        Ok(read) => read,
        Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(Some(String::new())),
        Err(err) => return Err(err.into()),
    };
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(buffer.trim_end_matches(['\n', '\r']).to_string()))
}
