use std::path::PathBuf;

use anyhow::bail;
use clap::Parser;
use comfyui_api::{comfy::SeedExt, JobReport, WorkflowFile};
use tracing::warn;

use super::{describe_outcome, Environment};

/// Runs workflows side by side with the same seed.
#[derive(Parser, Debug)]
pub struct CompareOpts {
    /// Workflow JSON files to compare
    #[arg(required = true, num_args = 1..)]
    workflows: Vec<PathBuf>,

    /// Seed set on every workflow
    #[arg(long, default_value_t = 54321)]
    seed: u64,
}

/// One row of the comparison.
#[derive(Debug)]
struct Row {
    name: String,
    status: String,
    success: bool,
}

impl Row {
    fn from_report(name: String, report: &JobReport) -> Self {
        let status = match (&report.result, report.prompt_id) {
            (Ok(outcome), Some(id)) => format!("{} ({})", describe_outcome(outcome), id),
            (Ok(outcome), None) => describe_outcome(outcome),
            (Err(e), _) => format!("not queued: {}", e),
        };
        Self {
            name,
            status,
            success: report.is_success(),
        }
    }
}

fn print_rows(rows: &[Row]) {
    let width = rows.iter().map(|row| row.name.len()).max().unwrap_or(0);
    for row in rows {
        let mark = if row.success { "PASS" } else { "FAIL" };
        println!("{} {:width$}  {}", mark, row.name, row.status, width = width);
    }
    let passed = rows.iter().filter(|row| row.success).count();
    println!("{}/{} workflows passed", passed, rows.len());
}

pub async fn exec(env: &Environment, opts: CompareOpts) -> anyhow::Result<()> {
    let comfy = env.live_comfy().await?;

    let mut names = vec![];
    let mut prompts = vec![];
    let mut rows: Vec<Option<Row>> = vec![];
    for path in &opts.workflows {
        let name = path.display().to_string();
        let loaded = WorkflowFile::from_path(path).and_then(|file| {
            let mut prompt = file.into_prompt();
            prompt.set_seed(opts.seed)?;
            Ok(prompt)
        });
        match loaded {
            Ok(prompt) => {
                names.push(name);
                prompts.push(prompt);
                rows.push(None);
            }
            Err(e) => {
                warn!(workflow = %name, error = %e, "skipping workflow");
                rows.push(Some(Row {
                    name,
                    status: format!("{:#}", e),
                    success: false,
                }));
            }
        }
    }

    println!(
        "Running {} workflow(s) with seed {}, at most {} at a time",
        prompts.len(),
        opts.seed,
        comfy.settings().concurrency()
    );
    let reports = comfy.execute_all(prompts).await;
    let mut finished = names
        .into_iter()
        .zip(&reports)
        .map(|(name, report)| Row::from_report(name, report));
    let rows: Vec<Row> = rows
        .into_iter()
        .filter_map(|row| row.or_else(|| finished.next()))
        .collect();

    print_rows(&rows);
    let failed = rows.iter().filter(|row| !row.success).count();
    if failed > 0 {
        bail!("{} of {} workflows failed", failed, rows.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::json;

    use super::*;
    use crate::config::{Config, PollConfig};

    fn write(dir: &Path, name: &str, value: serde_json::Value) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, value.to_string()).unwrap();
        path
    }

    fn sampler_workflow() -> serde_json::Value {
        json!({
            "3": {"class_type": "KSampler", "inputs": {"seed": 1, "model": ["4", 0]}},
            "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "a.safetensors"}},
            "9": {"class_type": "SaveImage", "inputs": {"images": ["3", 0]}}
        })
    }

    #[tokio::test]
    async fn test_compare_reports_failures() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/system_stats")
            .with_status(200)
            .with_body(json!({"system": {}, "devices": []}).to_string())
            .create_async()
            .await;
        let submit = server
            .mock("POST", "/prompt")
            .match_body(mockito::Matcher::PartialJson(json!({
                "prompt": {"3": {"inputs": {"seed": 777}}}
            })))
            .with_status(200)
            .with_body(
                json!({
                    "prompt_id": "ce911389-74e0-4b08-bb3d-2e73e875af1c",
                    "number": 1,
                    "node_errors": {}
                })
                .to_string(),
            )
            .create_async()
            .await;
        server
            .mock("GET", "/history/ce911389-74e0-4b08-bb3d-2e73e875af1c")
            .with_status(200)
            .with_body(
                json!({
                    "ce911389-74e0-4b08-bb3d-2e73e875af1c": {
                        "outputs": {},
                        "status": {
                            "status_str": "success",
                            "completed": true,
                            "messages": [["execution_success", {}]]
                        }
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let good = write(dir.path(), "good.json", sampler_workflow());
        let broken = write(
            dir.path(),
            "broken.json",
            json!({"1": {"class_type": "SaveImage", "inputs": {}}}),
        );

        let config = Config {
            poll: PollConfig {
                interval_secs: 0,
                timeout_secs: 5,
                ..PollConfig::default()
            },
            ..Config::default()
        };
        let env = Environment::new(config, server.url());
        let result = exec(
            &env,
            CompareOpts {
                workflows: vec![good, broken],
                seed: 777,
            },
        )
        .await;

        submit.assert_async().await;
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "1 of 2 workflows failed");
    }
}
