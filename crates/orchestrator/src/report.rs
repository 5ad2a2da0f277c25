//! Human-readable summary of a finished run.

use std::fmt::Write;

use docflow_core::{RunContext, StageName, StageStatus};

/// Markdown report rendered from a run snapshot.
pub struct RunReport;

impl RunReport {
    pub fn render(ctx: &RunContext) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = Self::write(&mut out, ctx);
        out
    }

    fn write(out: &mut String, ctx: &RunContext) -> std::fmt::Result {
        writeln!(out, "# Run {}", ctx.id)?;
        writeln!(out)?;
        writeln!(
            out,
            "- **Document:** {} ({}, {} bytes)",
            ctx.document.name, ctx.document.format, ctx.document.size_bytes
        )?;
        if let Ok(objective) = ctx.request.objective() {
            writeln!(out, "- **Objective:** {}", objective)?;
        }
        writeln!(out, "- **Status:** {}", ctx.status)?;
        if let Some(finished) = ctx.finished_at {
            let elapsed = finished - ctx.created_at;
            writeln!(out, "- **Duration:** {}ms", elapsed.num_milliseconds())?;
        }
        if let Some(reason) = &ctx.cancel_reason {
            writeln!(out, "- **Cancelled:** {}", reason)?;
        }

        writeln!(out)?;
        writeln!(out, "## Stages")?;
        writeln!(out)?;
        writeln!(out, "| Stage | Status | Attempts | Duration | Note |")?;
        writeln!(out, "|---|---|---|---|---|")?;
        for stage in StageName::ALL {
            match ctx.stage_result(stage) {
                Some(result) => writeln!(
                    out,
                    "| {} | {} | {} | {} | {} |",
                    stage.display_name(),
                    result.status.as_str(),
                    result.attempts,
                    result
                        .duration_ms()
                        .map(|ms| format!("{}ms", ms))
                        .unwrap_or_else(|| "-".to_string()),
                    match (&result.error, result.status) {
                        (Some(error), StageStatus::Failed | StageStatus::Retried) => {
                            escape_cell(&error.to_string())
                        }
                        _ => String::new(),
                    }
                )?,
                None => writeln!(out, "| {} | pending | 0 | - |  |", stage.display_name())?,
            }
        }

        if let Some(arranged) = ctx.arranged_data() {
            writeln!(out)?;
            writeln!(out, "## Data")?;
            writeln!(out)?;
            writeln!(
                out,
                "{} (completeness {:.0}%)",
                arranged.summary,
                arranged.completeness * 100.0
            )?;
        }

        if let Some(failure) = &ctx.failure {
            writeln!(out)?;
            writeln!(out, "## Failure")?;
            writeln!(out)?;
            writeln!(out, "- **Origin:** {}", failure.origin)?;
            writeln!(out, "- **Kind:** {}", failure.kind)?;
            writeln!(out, "- **Message:** {}", failure.message)?;
        }

        if let Some(execution) = &ctx.execution {
            writeln!(out)?;
            writeln!(out, "## Execution")?;
            writeln!(out)?;
            writeln!(out, "- **Exit:** {}", execution.exit_status)?;
            writeln!(out, "- **Duration:** {}ms", execution.duration_ms)?;
            if let Some(limit) = execution.limit {
                writeln!(out, "- **Limit exceeded:** {}", limit)?;
            }
            if !execution.missing_outputs.is_empty() {
                writeln!(
                    out,
                    "- **Missing outputs:** {}",
                    execution.missing_outputs.join(", ")
                )?;
            }
            if !execution.produced_files.is_empty() {
                writeln!(out)?;
                writeln!(out, "| File | Size |")?;
                writeln!(out, "|---|---|")?;
                for file in &execution.produced_files {
                    writeln!(out, "| {} | {} |", file.name, human_size(file.size_bytes))?;
                }
            }
            let stderr = execution.stderr.trim();
            if !stderr.is_empty() {
                writeln!(out)?;
                writeln!(out, "```text")?;
                writeln!(out, "{}", stderr)?;
                writeln!(out, "```")?;
            }
        }
        Ok(())
    }
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use docflow_core::{
        AnalysisRequest, AnalysisType, Document, DocumentFormat, ExecutionResult, ExitStatus,
        ProducedFile, RunFailure, RunStatus, StageError,
    };

    fn context() -> RunContext {
        let doc = Document::new("q3.txt", DocumentFormat::Txt, 12, "Revenue: 100");
        RunContext::new(
            Arc::new(doc),
            AnalysisRequest::predefined(AnalysisType::FinancialSummary),
        )
    }

    #[test]
    fn test_failed_run_report() {
        let mut ctx = context();
        ctx.stage_result_mut(StageName::Coordinator).begin_attempt();
        let error = StageError::transient("timed out | twice");
        ctx.stage_result_mut(StageName::Coordinator).fail(error.clone());
        ctx.failure = Some(RunFailure::from_stage(StageName::Coordinator, &error));
        ctx.finish(RunStatus::Failed);

        let report = RunReport::render(&ctx);
        assert!(report.contains("- **Status:** failed"));
        assert!(report.contains("| Coordinator | failed | 1 |"));
        assert!(report.contains("timed out \\| twice"));
        assert!(report.contains("| Code Generator | pending | 0 |"));
        assert!(report.contains("- **Origin:** stage:coordinator"));
        assert!(report.contains("- **Kind:** transient_failure"));
    }

    #[test]
    fn test_execution_section_lists_files() {
        let mut ctx = context();
        ctx.execution = Some(ExecutionResult {
            exit_status: ExitStatus::Code(0),
            stdout: "done".into(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            produced_files: vec![
                ProducedFile::inline("Financial_Report_20240101_000000.xlsx", vec![0; 2048]),
                ProducedFile::inline("notes.txt", vec![0; 10]),
            ],
            missing_outputs: Vec::new(),
            duration_ms: 120,
            limit_exceeded: false,
            limit: None,
        });
        let report = RunReport::render(&ctx);
        assert!(report.contains("- **Exit:** exit code 0"));
        assert!(report.contains("| Financial_Report_20240101_000000.xlsx | 2.0 KiB |"));
        assert!(report.contains("| notes.txt | 10 B |"));
        assert!(!report.contains("## Failure"));
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(1536), "1.5 KiB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MiB");
    }
}
