use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cbt_core::ledger::ResponseLedger;
use cbt_core::model::{Answer, Choice, Difficulty, Question, QuestionKind, Statement};
use cbt_core::scoring::{review, score};

const SUBJECTS: [&str; 4] = ["Math", "Biology", "Language", "History"];

fn make_questions(n: usize) -> Vec<Question> {
    (0..n)
        .map(|i| {
            let kind = match i % 3 {
                0 => QuestionKind::SingleChoice {
                    choices: ["A", "B", "C", "D", "E"]
                        .iter()
                        .map(|id| Choice {
                            id: (*id).into(),
                            text: format!("option {id}"),
                        })
                        .collect(),
                    correct: "C".into(),
                },
                1 => QuestionKind::MultiStatement {
                    statements: (0..4)
                        .map(|s| Statement {
                            id: format!("s{s}"),
                            text: format!("statement {s}"),
                            correct: s % 2 == 0,
                        })
                        .collect(),
                },
                _ => QuestionKind::FreeText {
                    correct: "Answer".into(),
                },
            };
            Question {
                id: format!("q{i}"),
                subject: SUBJECTS[i % SUBJECTS.len()].into(),
                difficulty: Difficulty::new((i % 5) as u8 + 1).unwrap(),
                text: format!("question {i}"),
                passage: None,
                image_url: None,
                explanation: String::new(),
                kind,
            }
        })
        .collect()
}

/// Answers roughly two thirds of the questions, half of them correctly.
fn make_ledger(questions: &[Question]) -> ResponseLedger {
    let mut ledger = ResponseLedger::new();
    for (i, q) in questions.iter().enumerate() {
        if i % 3 == 2 {
            continue;
        }
        let right = i % 2 == 0;
        let (choice, text) = if right { ("C", " answer ") } else { ("A", "nope") };
        let answer = match &q.kind {
            QuestionKind::SingleChoice { .. } => Answer::Choice(choice.into()),
            QuestionKind::MultiStatement { statements } => Answer::Statements(
                statements
                    .iter()
                    .map(|s| Some(if right { s.correct } else { !s.correct }))
                    .collect(),
            ),
            QuestionKind::FreeText { .. } => Answer::Text(text.into()),
        };
        ledger.record(q.id.clone(), Some(answer), i % 7 == 0);
    }
    ledger
}

fn bench_score(c: &mut Criterion) {
    let mut group = c.benchmark_group("score");

    for n in [20, 200, 2000] {
        let questions = make_questions(n);
        let ledger = make_ledger(&questions);
        group.bench_function(format!("questions={n}"), |b| {
            b.iter(|| score(black_box(&questions), black_box(&ledger)))
        });
    }

    group.finish();
}

fn bench_review(c: &mut Criterion) {
    let questions = make_questions(200);
    let ledger = make_ledger(&questions);

    c.bench_function("review/questions=200", |b| {
        b.iter(|| review(black_box(&questions), black_box(&ledger)))
    });
}

criterion_group!(benches, bench_score, bench_review);
criterion_main!(benches);
