//! The `cbt run` command: a line-oriented exam console.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use cbt_core::clock::SystemClock;
use cbt_core::controller::{EventSink, ResumeOutcome};
use cbt_core::model::{Answer, ExamPackage, ExamResult, QuestionKind};
use cbt_core::parser::{self, DirectoryCatalog};
use cbt_core::scoring;
use cbt_core::timer::format_remaining;
use cbt_core::{ExamError, ExamEvent, ExamState, SessionController, SubmitOutcome};
use cbt_store::{create_local_store, create_remote_store, load_config_from, CbtConfig};

use super::score::{print_review, print_score_card};

/// Console event printer.
struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn emit(&self, event: ExamEvent) {
        match event {
            ExamEvent::SectionChanged {
                index,
                section_id,
                remaining_secs,
            } => eprintln!(
                "\n== Section {} [{section_id}], {} remaining ==",
                index + 1,
                format_remaining(remaining_secs)
            ),
            ExamEvent::AnswerRecorded {
                question_id,
                answered,
            } => {
                let verb = if answered { "saved" } else { "cleared" };
                eprintln!("  {verb} {question_id}");
            }
            ExamEvent::FlagToggled {
                question_id,
                flagged,
            } => {
                let verb = if flagged { "flagged" } else { "unflagged" };
                eprintln!("  {question_id} {verb}");
            }
            ExamEvent::TimeLowWarning {
                section_id,
                remaining_secs,
            } => eprintln!(
                "  Warning: {} left in {section_id}",
                format_remaining(remaining_secs)
            ),
            ExamEvent::SectionForcedSubmit { section_id, .. } => {
                eprintln!("  Time is up, section {section_id} submitted")
            }
            ExamEvent::AttemptFinalized(_) => {}
            ExamEvent::FinalizeFailed { message } => {
                eprintln!("  Result not saved: {message}");
                eprintln!("  Type 'retry' to try again.");
            }
        }
    }
}

/// A parsed console command.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Show,
    Status,
    Answer { question_id: String, value: String },
    Flag { question_id: String },
    Submit,
    Retry,
    Help,
    Quit,
}

enum Flow {
    Continue,
    Quit,
}

pub async fn execute(package: Option<String>, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config_from(config_path.as_deref())?;
    let local = create_local_store(&config)?;
    let remote = create_remote_store(&config)?;

    let mut controller =
        SessionController::new(config.user_id.clone(), local, remote, Arc::new(SystemClock))
            .with_events(Arc::new(ConsoleSink))
            .with_timer_policy(config.timer.policy());

    match package {
        Some(arg) => {
            let package = resolve_package(&arg, &config)?;
            for w in parser::validate_package(&package) {
                eprintln!("WARNING: {}", w.message);
            }
            controller.open(Arc::new(package)).await?;
        }
        None => {
            let catalog = DirectoryCatalog::new(config.packages_dir.clone());
            match controller.resume(&catalog).await? {
                ResumeOutcome::Resumed { .. } => {}
                ResumeOutcome::NoActiveSession => {
                    anyhow::bail!("no attempt in progress; pass --package to start one")
                }
                ResumeOutcome::PackageUnavailable { package_id, reason } => {
                    anyhow::bail!("attempt on package '{package_id}' cannot be resumed: {reason}")
                }
            }
        }
    }

    if let Some(package) = controller.package() {
        println!("{} ({} sections)", package.title, package.sections.len());
    }
    show_section(&controller);
    eprintln!("Type 'help' for commands.");

    let mut input = spawn_input_reader();
    let period = Duration::from_millis(config.timer.tick_interval_ms.max(10));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    while controller.state() != ExamState::Completed {
        tokio::select! {
            _ = ticker.tick() => {
                match controller.tick().await {
                    Ok(Some(report)) => {
                        if let Some(outcome) = report.submitted {
                            after_submit(&controller, outcome);
                        }
                    }
                    Ok(None) => {}
                    // already reported through the event sink
                    Err(e) if e.is_retryable() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            line = input.recv() => {
                let Some(line) = line else {
                    break;
                };
                let line = line.context("failed to read input")?;
                match handle_line(&mut controller, &line).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Quit) => break,
                    Err(e) if is_retryable(&e) => {}
                    Err(e) => eprintln!("  {e:#}"),
                }
            }
        }
    }

    controller.flush().await;
    if controller.state() != ExamState::Completed {
        eprintln!("Progress saved. Run `cbt run` to resume.");
    }
    Ok(())
}

/// Read stdin lines on a detached thread so a pending read never holds up
/// runtime shutdown.
fn spawn_input_reader() -> mpsc::UnboundedReceiver<std::io::Result<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn is_retryable(e: &anyhow::Error) -> bool {
    e.downcast_ref::<ExamError>()
        .is_some_and(ExamError::is_retryable)
}

/// A path to a package file, or a package ID under `packages_dir`.
fn resolve_package(arg: &str, config: &CbtConfig) -> Result<ExamPackage> {
    let path = Path::new(arg);
    if path.is_file() {
        return parser::parse_package(path);
    }
    parser::find_package(&config.packages_dir, arg)?.with_context(|| {
        format!(
            "package '{arg}' not found in {}",
            config.packages_dir.display()
        )
    })
}

async fn handle_line(controller: &mut SessionController, line: &str) -> Result<Flow> {
    let Some(command) = parse_command(line)? else {
        return Ok(Flow::Continue);
    };

    match command {
        Command::Show => show_section(controller),
        Command::Status => show_status(controller),
        Command::Help => print_help(),
        Command::Quit => return Ok(Flow::Quit),
        Command::Answer { question_id, value } => {
            let kind = controller
                .current_section()
                .and_then(|s| s.question(&question_id))
                .map(|q| q.kind.clone())
                .ok_or_else(|| ExamError::UnknownQuestion(question_id.clone()))?;
            let answer = parse_answer(&kind, &value)?;
            controller.record_answer(&question_id, answer)?;
        }
        Command::Flag { question_id } => {
            controller.toggle_flag(&question_id)?;
        }
        Command::Submit => {
            let outcome = controller.submit_section().await?;
            after_submit(controller, outcome);
        }
        Command::Retry => {
            let outcome = controller.finalize().await?;
            after_submit(controller, outcome);
        }
    }
    Ok(Flow::Continue)
}

/// Parse one input line. Blank lines yield `None`.
fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = line
        .split_once(char::is_whitespace)
        .map(|(v, r)| (v, r.trim()))
        .unwrap_or((line, ""));

    let command = match verb.to_lowercase().as_str() {
        "show" | "s" => Command::Show,
        "status" => Command::Status,
        "submit" => Command::Submit,
        "retry" => Command::Retry,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        "flag" | "f" => {
            anyhow::ensure!(!rest.is_empty(), "usage: flag <question>");
            Command::Flag {
                question_id: rest.to_string(),
            }
        }
        "answer" | "a" => {
            let (question_id, value) = rest
                .split_once(char::is_whitespace)
                .context("usage: answer <question> <value>")?;
            Command::Answer {
                question_id: question_id.to_string(),
                value: value.trim().to_string(),
            }
        }
        other => anyhow::bail!("unknown command '{other}', type 'help'"),
    };
    Ok(Some(command))
}

/// Turn console input into an answer of the question's shape.
///
/// `-` clears the answer. Multi-statement input is one `T`, `F` or `?`
/// per statement, e.g. `TF?`.
fn parse_answer(kind: &QuestionKind, raw: &str) -> Result<Option<Answer>> {
    let raw = raw.trim();
    if raw == "-" {
        return Ok(None);
    }

    let answer = match kind {
        QuestionKind::SingleChoice { choices, .. } => {
            let choice = choices
                .iter()
                .find(|c| c.id.eq_ignore_ascii_case(raw))
                .with_context(|| {
                    let ids: Vec<&str> = choices.iter().map(|c| c.id.as_str()).collect();
                    format!("unknown option '{raw}', expected one of {}", ids.join(", "))
                })?;
            Answer::Choice(choice.id.clone())
        }
        QuestionKind::MultiStatement { statements } => {
            let values = raw
                .chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| match c.to_ascii_uppercase() {
                    'T' => Ok(Some(true)),
                    'F' => Ok(Some(false)),
                    '?' | '_' => Ok(None),
                    other => Err(anyhow::anyhow!("'{other}' is not T, F or ?")),
                })
                .collect::<Result<Vec<_>>>()?;
            anyhow::ensure!(
                values.len() == statements.len(),
                "expected {} marks, got {}",
                statements.len(),
                values.len()
            );
            Answer::Statements(values)
        }
        QuestionKind::FreeText { .. } => Answer::Text(raw.to_string()),
    };
    Ok(Some(answer))
}

fn after_submit(controller: &SessionController, outcome: SubmitOutcome) {
    match outcome {
        SubmitOutcome::Advanced { .. } => show_section(controller),
        SubmitOutcome::Finalized(result) => print_result(controller, &result),
    }
}

fn describe_answer(answer: &Answer) -> String {
    match answer {
        Answer::Choice(id) => id.clone(),
        Answer::Text(text) => text.clone(),
        Answer::Statements(values) => values
            .iter()
            .map(|v| match v {
                Some(true) => 'T',
                Some(false) => 'F',
                None => '?',
            })
            .collect(),
    }
}

fn show_section(controller: &SessionController) {
    let (Some(section), Some(session)) = (controller.current_section(), controller.session())
    else {
        return;
    };
    show_status(controller);

    for (n, q) in section.questions.iter().enumerate() {
        let flag = if session.responses.is_flagged(&q.id) {
            " [flagged]"
        } else {
            ""
        };
        println!(
            "\n{}. [{}] {} (difficulty {}){flag}",
            n + 1,
            q.id,
            q.subject,
            q.difficulty
        );
        if let Some(passage) = &q.passage {
            println!("   > {passage}");
        }
        println!("   {}", q.text);
        if let Some(url) = &q.image_url {
            println!("   (image: {url})");
        }
        match &q.kind {
            QuestionKind::SingleChoice { choices, .. } => {
                for c in choices {
                    println!("     {}) {}", c.id, c.text);
                }
            }
            QuestionKind::MultiStatement { statements } => {
                for (i, s) in statements.iter().enumerate() {
                    println!("     {}. {}", i + 1, s.text);
                }
                println!("     (mark each with T or F, e.g. answer {} TF)", q.id);
            }
            QuestionKind::FreeText { .. } => println!("     (free text)"),
        }
        if let Some(answer) = session.responses.answer(&q.id) {
            println!("   answer: {}", describe_answer(answer));
        }
    }
}

fn show_status(controller: &SessionController) {
    match controller.progress() {
        Some(p) => println!(
            "Section {}/{} {}: {}/{} answered, {} flagged, {} left",
            p.section_index + 1,
            p.section_count,
            p.section_title,
            p.answered,
            p.total,
            p.flagged,
            format_remaining(p.remaining_secs)
        ),
        None => println!("No section in progress ({})", controller.state()),
    }
}

fn print_result(controller: &SessionController, result: &ExamResult) {
    println!("\nFinal score: {}", result.total_score);
    let Some(package) = controller.package() else {
        return;
    };

    print_score_card(&scoring::score(package.all_questions(), &result.responses));
    print_review(&scoring::review(package.all_questions(), &result.responses));

    for q in package.all_questions().filter(|q| !q.explanation.is_empty()) {
        println!("{}: {}", q.id, q.explanation);
    }
}

fn print_help() {
    println!("Commands:");
    println!("  show                    list the questions of this section");
    println!("  status                  answered count and time left");
    println!("  answer <id> <value>     option id, T/F marks, or text; '-' clears");
    println!("  flag <id>               toggle the review flag");
    println!("  submit                  submit this section");
    println!("  retry                   retry saving the result");
    println!("  quit                    leave; the attempt can be resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbt_core::model::{Choice, Statement};

    fn choices() -> QuestionKind {
        QuestionKind::SingleChoice {
            choices: vec![
                Choice {
                    id: "A".into(),
                    text: "one".into(),
                },
                Choice {
                    id: "B".into(),
                    text: "two".into(),
                },
            ],
            correct: "B".into(),
        }
    }

    fn statements(n: usize) -> QuestionKind {
        QuestionKind::MultiStatement {
            statements: (0..n)
                .map(|i| Statement {
                    id: i.to_string(),
                    text: format!("statement {i}"),
                    correct: true,
                })
                .collect(),
        }
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("   ").unwrap(), None);
        assert_eq!(parse_command("submit").unwrap(), Some(Command::Submit));
        assert_eq!(parse_command("Q").unwrap(), Some(Command::Quit));
        assert_eq!(
            parse_command("answer lbi-1  ibu kota ").unwrap(),
            Some(Command::Answer {
                question_id: "lbi-1".into(),
                value: "ibu kota".into()
            })
        );
        assert_eq!(
            parse_command("flag pu-2").unwrap(),
            Some(Command::Flag {
                question_id: "pu-2".into()
            })
        );
    }

    #[test]
    fn rejects_bad_commands() {
        assert!(parse_command("answer pu-1").is_err());
        assert!(parse_command("flag").is_err());
        assert!(parse_command("dance").is_err());
    }

    #[test]
    fn single_choice_matches_option_ids() {
        assert_eq!(
            parse_answer(&choices(), "b").unwrap(),
            Some(Answer::Choice("B".into()))
        );
        assert!(parse_answer(&choices(), "C").is_err());
        assert_eq!(parse_answer(&choices(), "-").unwrap(), None);
    }

    #[test]
    fn statement_marks() {
        assert_eq!(
            parse_answer(&statements(3), "T f ?").unwrap(),
            Some(Answer::Statements(vec![Some(true), Some(false), None]))
        );
        assert!(parse_answer(&statements(3), "TF").is_err());
        assert!(parse_answer(&statements(2), "TX").is_err());
    }

    #[test]
    fn free_text_is_trimmed() {
        let kind = QuestionKind::FreeText {
            correct: "Jakarta".into(),
        };
        assert_eq!(
            parse_answer(&kind, "  Jakarta ").unwrap(),
            Some(Answer::Text("Jakarta".into()))
        );
    }

    #[test]
    fn statement_answers_render_as_marks() {
        let answer = Answer::Statements(vec![Some(true), None, Some(false)]);
        assert_eq!(describe_answer(&answer), "T?F");
    }
}
