//! A full chain against an in-process quiz server, using the real HTTP page
//! visitor and submitter with scripted extraction and solving.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, header},
    response::{Html, IntoResponse},
    routing::{get, post},
};
use serde_json::{Value, json};
use tempfile::TempDir;

use chain_solver::audit::{AuditLogger, TerminalRecord};
use chain_solver::chain::{
    Answer, ChainOrchestrator, ChainState, ChallengeLink, Collaborators, Credentials, PageContext,
    RetryPolicy, TaskDescription, TriedAnswer,
};
use chain_solver::errors::{ExtractError, SolveError};
use chain_solver::extract::TaskExtractor;
use chain_solver::page::{DisabledTranscriber, HttpPageVisitor, PageVisitor, prepare_work_dir};
use chain_solver::sandbox::{CapabilitySet, ExecutionLimits, HostContext, Sandbox};
use chain_solver::solver::AnswerSolver;
use chain_solver::submit::HttpSubmitter;

#[derive(Clone)]
struct Quiz {
    base: String,
    submissions: Arc<Mutex<Vec<(Value, Option<String>, Option<String>)>>>,
}

fn cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn first_page() -> impl IntoResponse {
    (
        [(header::SET_COOKIE, "session=abc; Path=/")],
        Html(
            "<html><body><h1>Quiz 1</h1><p>What is 10 + 20?</p>\
             <p>POST the answer to /submit</p></body></html>",
        ),
    )
}

async fn second_page(headers: HeaderMap) -> Html<String> {
    let stage = cookie(&headers).unwrap_or_default();
    if stage.contains("stage=2") {
        Html("<html><body><p>Say the magic word.</p></body></html>".to_string())
    } else {
        Html("<html><body><p>Locked.</p></body></html>".to_string())
    }
}

async fn data_page() -> Html<&'static str> {
    Html(
        "<html><body><p>Sum the score column of the <a href=\"/files/data.csv\">data</a>.</p>\
         </body></html>",
    )
}

async fn data_csv() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/csv")], "score\n1\n2\n3\n")
}

async fn submit(
    State(quiz): State<Quiz>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let referer = headers
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    quiz.submissions
        .lock()
        .unwrap()
        .push((payload.clone(), cookie(&headers), referer));

    let url = payload["url"].as_str().unwrap_or_default();
    let answer = &payload["answer"];
    if url.ends_with("/data") {
        return Json(json!({"correct": answer == &json!(6), "url": ""})).into_response();
    }
    if url.ends_with("/q1") {
        if answer == &json!(30) {
            (
                [(header::SET_COOKIE, "stage=2; Path=/")],
                Json(json!({"correct": true, "url": format!("{}/q2", quiz.base)})),
            )
                .into_response()
        } else {
            Json(json!({"correct": false, "reason": "Too low"})).into_response()
        }
    } else if answer == &json!("please") {
        Json(json!({"correct": true, "url": ""})).into_response()
    } else {
        Json(json!({"correct": false, "reason": "No"})).into_response()
    }
}

async fn start_quiz() -> Quiz {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let quiz = Quiz {
        base: format!("http://{}", listener.local_addr().unwrap()),
        submissions: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/q1", get(first_page))
        .route("/q2", get(second_page))
        .route("/data", get(data_page))
        .route("/files/data.csv", get(data_csv))
        .route("/submit", post(submit))
        .with_state(quiz.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    quiz
}

/// Points every task at `/submit` and passes the page text through as the question.
struct PassThroughExtractor;

#[async_trait]
impl TaskExtractor for PassThroughExtractor {
    async fn extract(&self, page: &PageContext) -> Result<TaskDescription, ExtractError> {
        chain_solver::extract::parse_task(
            &json!({
                "submission_url": "/submit",
                "json_format": {"answer": 0},
                "question": page.text,
            })
            .to_string(),
            &page.url,
        )
    }
}

/// Guesses low once on the arithmetic page, then gets it right.
struct QuizSolver;

#[async_trait]
impl AnswerSolver for QuizSolver {
    async fn solve(
        &self,
        task: &TaskDescription,
        _page: &PageContext,
        tried: &[TriedAnswer],
    ) -> Result<Answer, SolveError> {
        if task.question.contains("10 + 20") {
            Ok(if tried.is_empty() {
                Answer::Number(25.into())
            } else {
                Answer::Number(30.into())
            })
        } else if task.question.contains("magic word") {
            Ok(Answer::Text("please".into()))
        } else {
            Ok(Answer::Text("locked out".into()))
        }
    }
}

/// Sums the first downloaded CSV in the sandbox, reading it from the path the
/// page context lists.
struct CsvSolver {
    sandbox: Sandbox,
}

#[async_trait]
impl AnswerSolver for CsvSolver {
    async fn solve(
        &self,
        _task: &TaskDescription,
        page: &PageContext,
        _tried: &[TriedAnswer],
    ) -> Result<Answer, SolveError> {
        let path = &page.downloaded_artifacts[0].local_path;
        let output = self.sandbox.run(&sum_scores(path)).await;
        Ok(Answer::from_model_output(&output))
    }
}

fn sandbox(work_dir: PathBuf) -> Sandbox {
    Sandbox::new(
        Arc::new(CapabilitySet::standard(HostContext::new(
            reqwest::Client::new(),
            work_dir,
            None,
        ))),
        ExecutionLimits::default(),
    )
}

fn sum_scores(csv_path: &Path) -> String {
    format!(
        "result = sum(parseCsv(readText({})).map(r => r.score))",
        json!(csv_path)
    )
}

/// A work directory given relative to the current directory.
fn relative_work_dir() -> (TempDir, PathBuf) {
    let dir = tempfile::Builder::new().prefix("work-").tempdir_in(".").unwrap();
    let relative = PathBuf::from(dir.path().file_name().unwrap());
    (dir, relative)
}

fn collaborators(work_dir: &TempDir) -> Collaborators {
    let http = reqwest::Client::new();
    Collaborators {
        visitor: Arc::new(HttpPageVisitor::new(
            http.clone(),
            work_dir.path().to_path_buf(),
            Arc::new(DisabledTranscriber),
        )),
        extractor: Arc::new(PassThroughExtractor),
        solver: Arc::new(QuizSolver),
        submitter: Arc::new(HttpSubmitter::new(http)),
    }
}

fn credentials() -> Credentials {
    Credentials {
        email: "student@example.com".into(),
        secret: "s3cret".into(),
    }
}

#[tokio::test]
async fn test_chain_runs_to_done_across_two_links() {
    let quiz = start_quiz().await;
    let work_dir = TempDir::new().unwrap();
    let audit_dir = TempDir::new().unwrap();

    let report = ChainOrchestrator::new(
        collaborators(&work_dir),
        credentials(),
        RetryPolicy::default(),
    )
    .with_audit(AuditLogger::new(audit_dir.path()))
    .run(&format!("{}/q1", quiz.base))
    .await;

    assert_eq!(report.state, ChainState::Done, "{:?}", report.abort_reason);
    assert_eq!(
        report.links_solved,
        vec![format!("{}/q1", quiz.base), format!("{}/q2", quiz.base)]
    );
    assert_eq!(report.attempts, 3);

    let submissions = quiz.submissions.lock().unwrap();
    assert_eq!(submissions.len(), 3);

    // wrong guess, then the retry, both on the first link with its page cookie
    let (first, first_cookie, first_referer) = &submissions[0];
    assert_eq!(first["answer"], json!(25));
    assert_eq!(first["email"], "student@example.com");
    assert_eq!(first["secret"], "s3cret");
    assert_eq!(first["url"], format!("{}/q1", quiz.base));
    assert!(first_cookie.as_deref().unwrap_or_default().contains("session=abc"));
    assert_eq!(first_referer.as_deref(), Some(format!("{}/q1", quiz.base).as_str()));
    assert_eq!(submissions[1].0["answer"], json!(30));

    // the second link saw the cookie set by the first correct submission
    let (second, second_cookie, _) = &submissions[2];
    assert_eq!(second["answer"], json!("please"));
    assert!(second_cookie.as_deref().unwrap_or_default().contains("stage=2"));

    let audit_file = report.audit_file.expect("audit file written");
    let run = AuditLogger::load_run(&audit_file).unwrap();
    assert_eq!(run.attempts.len(), 3);
    assert!(matches!(run.terminal, Some(TerminalRecord::Done { .. })));
    assert_eq!(AuditLogger::list_runs(audit_dir.path()).unwrap().len(), 1);
}

#[tokio::test]
async fn test_unreachable_start_page_aborts() {
    let work_dir = TempDir::new().unwrap();
    // nothing listens on port 9 of localhost
    let report = ChainOrchestrator::new(
        collaborators(&work_dir),
        credentials(),
        RetryPolicy::default(),
    )
    .run("http://127.0.0.1:9/q1")
    .await;

    assert_eq!(report.state, ChainState::Aborted);
    assert!(report.links_solved.is_empty());
    assert_eq!(report.attempts, 0);
}

#[tokio::test]
async fn test_downloaded_csv_is_readable_in_sandbox_from_listed_path() {
    let quiz = start_quiz().await;
    let (_guard, relative) = relative_work_dir();
    let visitor = HttpPageVisitor::new(
        reqwest::Client::new(),
        relative.clone(),
        Arc::new(DisabledTranscriber),
    );

    let page = visitor
        .visit(&ChallengeLink::start(format!("{}/data", quiz.base)))
        .await;

    assert!(page.fetch_error.is_none(), "{:?}", page.fetch_error);
    assert_eq!(page.downloaded_artifacts.len(), 1);
    let artifact = &page.downloaded_artifacts[0];
    assert_eq!(artifact.source_url, format!("{}/files/data.csv", quiz.base));
    assert!(artifact.local_path.is_absolute());
    assert!(page.render().contains(&artifact.local_path.display().to_string()));

    // the sandbox is configured with the same relative directory
    let output = sandbox(relative).run(&sum_scores(&artifact.local_path)).await;
    assert_eq!(output, "6");
}

#[tokio::test]
async fn test_chain_solves_from_downloaded_csv_and_clears_visit_dirs() {
    let quiz = start_quiz().await;
    let (_guard, relative) = relative_work_dir();
    let work_dir = prepare_work_dir(&relative).unwrap();
    assert!(work_dir.is_absolute());

    let http = reqwest::Client::new();
    let collaborators = Collaborators {
        visitor: Arc::new(HttpPageVisitor::new(
            http.clone(),
            work_dir.clone(),
            Arc::new(DisabledTranscriber),
        )),
        extractor: Arc::new(PassThroughExtractor),
        solver: Arc::new(CsvSolver {
            sandbox: sandbox(work_dir.clone()),
        }),
        submitter: Arc::new(HttpSubmitter::new(http)),
    };

    let report = ChainOrchestrator::new(collaborators, credentials(), RetryPolicy::default())
        .run(&format!("{}/data", quiz.base))
        .await;

    assert_eq!(report.state, ChainState::Done, "{:?}", report.abort_reason);
    assert_eq!(report.links_solved, vec![format!("{}/data", quiz.base)]);
    assert_eq!(quiz.submissions.lock().unwrap()[0].0["answer"], json!(6));
    assert_eq!(std::fs::read_dir(&work_dir).unwrap().count(), 0);
}
