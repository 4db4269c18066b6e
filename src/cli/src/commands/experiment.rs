//! Experiment lifecycle commands.
//!
//! Create, list, start, pause, resume, stop, analyze, delete, and traffic
//! injection for experiments.

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;
use uuid::Uuid;

use crate::client::{ApiClient, Experiment};
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ExperimentCommands {
    /// Create a new experiment
    Create {
        /// Path to a JSON experiment spec file
        #[arg(short, long)]
        file: Option<String>,

        /// Experiment name (for inline creation)
        #[arg(short, long)]
        name: Option<String>,

        /// Variant as "Name:percentage" or "Name:percentage:control"
        /// (repeatable)
        #[arg(short, long = "variant")]
        variants: Vec<String>,

        /// Metric as "Name:type:goal", e.g. "Purchase:conversion:maximize"
        /// (repeatable)
        #[arg(short, long = "metric")]
        metrics: Vec<String>,

        /// Run length in days
        #[arg(long, default_value = "14")]
        duration: u32,

        /// Percent of traffic eligible for the experiment
        #[arg(long, default_value = "100")]
        traffic_allocation: f64,

        /// Confidence threshold for declaring a winner
        #[arg(long, default_value = "95")]
        confidence_level: f64,
    },

    /// List experiments
    List {
        /// Filter by status (draft, running, paused, completed, stopped)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show one experiment with derived statistics
    Get {
        /// Experiment ID
        id: Uuid,
    },

    /// Start an experiment (from draft or paused)
    Start { id: Uuid },

    /// Pause a running experiment
    Pause { id: Uuid },

    /// Resume a paused experiment
    Resume { id: Uuid },

    /// Stop an experiment and run the final evaluation
    Stop { id: Uuid },

    /// Delete an experiment and close its live channels
    Delete { id: Uuid },

    /// Run a read-only statistical analysis
    Analyze { id: Uuid },

    /// Record visitor/conversion increments for a variant
    Traffic {
        /// Experiment ID
        id: Uuid,

        /// Variant ID
        #[arg(short, long)]
        variant: Uuid,

        /// Visitors to add
        #[arg(long, default_value = "0")]
        visitors: u64,

        /// Conversions to add
        #[arg(long, default_value = "0")]
        conversions: u64,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateExperimentRequest {
    name: String,
    description: String,
    variants: Vec<VariantReq>,
    metrics: Vec<MetricReq>,
    duration: u32,
    traffic_allocation: f64,
    confidence_level: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VariantReq {
    name: String,
    traffic_percentage: f64,
    is_control: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricReq {
    name: String,
    #[serde(rename = "type")]
    metric_type: String,
    goal: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TrafficRequest {
    variant_id: String,
    visitors: u64,
    conversions: u64,
}

#[derive(Debug, Serialize, Tabled)]
struct ExperimentRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Variants")]
    variants: usize,
    #[tabled(rename = "Visitors")]
    visitors: u64,
    #[tabled(rename = "Significance")]
    significance: String,
    #[tabled(rename = "Winner")]
    winner: String,
}

impl From<&Experiment> for ExperimentRow {
    fn from(e: &Experiment) -> Self {
        let winner_name = e
            .winner
            .as_ref()
            .and_then(|id| e.variants.iter().find(|v| &v.id == id))
            .map(|v| v.name.clone())
            .unwrap_or_else(|| "-".to_string());
        Self {
            id: e.id.chars().take(8).collect(),
            name: e.name.clone(),
            status: e.status.clone(),
            variants: e.variants.len(),
            visitors: e.variants.iter().map(|v| v.visitors).sum(),
            significance: format!("{:.1}%", e.statistical_significance),
            winner: winner_name,
        }
    }
}

// ── Spec parsing ────────────────────────────────────────────────────────────

/// Parse "Name:percentage" or "Name:percentage:control".
fn parse_variant(input: &str) -> Result<VariantReq> {
    let parts: Vec<&str> = input.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        bail!("variant must be \"Name:percentage\" or \"Name:percentage:control\", got {input:?}");
    }
    let traffic_percentage: f64 = parts[1]
        .parse()
        .with_context(|| format!("invalid traffic percentage in {input:?}"))?;
    let is_control = match parts.get(2) {
        Some(&"control") => true,
        Some(other) => bail!("unexpected variant flag {other:?}, only \"control\" is allowed"),
        None => false,
    };
    Ok(VariantReq {
        name: parts[0].to_string(),
        traffic_percentage,
        is_control,
    })
}

/// Parse "Name:type:goal", e.g. "Purchase:conversion:maximize".
fn parse_metric(input: &str) -> Result<MetricReq> {
    let parts: Vec<&str> = input.split(':').collect();
    if parts.len() != 3 {
        bail!("metric must be \"Name:type:goal\", got {input:?}");
    }
    if !matches!(parts[1], "conversion" | "engagement" | "revenue") {
        bail!("metric type must be conversion, engagement, or revenue");
    }
    if !matches!(parts[2], "maximize" | "minimize") {
        bail!("metric goal must be maximize or minimize");
    }
    Ok(MetricReq {
        name: parts[0].to_string(),
        metric_type: parts[1].to_string(),
        goal: parts[2].to_string(),
    })
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(
    cmd: ExperimentCommands,
    client: &ApiClient,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        ExperimentCommands::Create {
            file,
            name,
            variants,
            metrics,
            duration,
            traffic_allocation,
            confidence_level,
        } => {
            let experiment: Experiment = if let Some(path) = file {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read spec file: {}", path))?;
                let spec: serde_json::Value =
                    serde_json::from_str(&content).context("Failed to parse spec JSON")?;
                client.post("/experiments", &spec).await?
            } else {
                let name = name.context("either --file or --name is required")?;
                let variants = variants
                    .iter()
                    .map(|v| parse_variant(v))
                    .collect::<Result<Vec<_>>>()?;
                let metrics = metrics
                    .iter()
                    .map(|m| parse_metric(m))
                    .collect::<Result<Vec<_>>>()?;
                let body = CreateExperimentRequest {
                    name,
                    description: String::new(),
                    variants,
                    metrics,
                    duration,
                    traffic_allocation,
                    confidence_level,
                };
                client.post("/experiments", &body).await?
            };

            match format {
                OutputFormat::Table => {
                    output::print_success("Experiment created");
                    output::print_detail("ID", &experiment.id);
                    output::print_detail("Name", &experiment.name);
                    output::print_detail("Status", &experiment.status);
                }
                _ => output::print_item(&experiment, format),
            }
        }

        ExperimentCommands::List { status } => {
            let path = match &status {
                Some(s) => format!("/experiments?status={}", s),
                None => "/experiments".to_string(),
            };
            let experiments: Vec<Experiment> = client.get(&path).await?;
            let rows: Vec<ExperimentRow> = experiments.iter().map(ExperimentRow::from).collect();
            output::print_list(&rows, format);
        }

        ExperimentCommands::Get { id } => {
            let experiment: Experiment = client.get(&format!("/experiments/{}", id)).await?;
            print_experiment(&experiment, format);
        }

        ExperimentCommands::Start { id } => {
            let experiment: Experiment = client
                .post(&format!("/experiments/{}/start", id), &serde_json::json!({}))
                .await?;
            output::print_success(&format!("Experiment {} is {}", id, experiment.status));
        }

        ExperimentCommands::Pause { id } => {
            let experiment: Experiment = client
                .post(&format!("/experiments/{}/pause", id), &serde_json::json!({}))
                .await?;
            output::print_success(&format!("Experiment {} is {}", id, experiment.status));
        }

        ExperimentCommands::Resume { id } => {
            let experiment: Experiment = client
                .post(&format!("/experiments/{}/resume", id), &serde_json::json!({}))
                .await?;
            output::print_success(&format!("Experiment {} is {}", id, experiment.status));
        }

        ExperimentCommands::Stop { id } => {
            let experiment: Option<Experiment> = client
                .post(&format!("/experiments/{}/stop", id), &serde_json::json!({}))
                .await?;
            match experiment {
                Some(e) => {
                    output::print_success(&format!("Experiment {} is {}", id, e.status));
                    if let Some(winner) = winner_name(&e) {
                        output::print_detail("Winner", &winner);
                        output::print_detail(
                            "Significance",
                            &format!("{:.1}%", e.statistical_significance),
                        );
                    } else {
                        output::print_info("No variant reached the confidence threshold");
                    }
                }
                None => output::print_info("Experiment does not exist; nothing to stop"),
            }
        }

        ExperimentCommands::Delete { id } => {
            let _removed: Option<Experiment> =
                client.delete(&format!("/experiments/{}", id)).await?;
            output::print_success(&format!("Experiment {} deleted", id));
        }

        ExperimentCommands::Analyze { id } => {
            let analysis: serde_json::Value = client
                .post(&format!("/experiments/{}/analyze", id), &serde_json::json!({}))
                .await?;
            match format {
                OutputFormat::Table => {
                    output::print_header("Analysis");
                    if let Some(significance) =
                        analysis.pointer("/analysis/significance").and_then(|v| v.as_f64())
                    {
                        output::print_detail("Significance", &format!("{:.1}%", significance));
                    }
                    if let Some(recommendations) = analysis
                        .pointer("/analysis/recommendations")
                        .and_then(|v| v.as_array())
                    {
                        for recommendation in recommendations {
                            if let Some(text) = recommendation.as_str() {
                                output::print_info(text);
                            }
                        }
                    }
                }
                _ => output::print_item(&analysis, format),
            }
        }

        ExperimentCommands::Traffic {
            id,
            variant,
            visitors,
            conversions,
        } => {
            let body = TrafficRequest {
                variant_id: variant.to_string(),
                visitors,
                conversions,
            };
            let experiment: Experiment = client
                .post(&format!("/experiments/{}/traffic", id), &body)
                .await?;
            output::print_success(&format!(
                "Recorded {} visitors / {} conversions (version {})",
                visitors, conversions, experiment.version
            ));
        }
    }

    Ok(())
}

fn winner_name(experiment: &Experiment) -> Option<String> {
    experiment.winner.as_ref().map(|id| {
        experiment
            .variants
            .iter()
            .find(|v| &v.id == id)
            .map(|v| v.name.clone())
            .unwrap_or_else(|| id.clone())
    })
}

fn print_experiment(experiment: &Experiment, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            output::print_header(&format!("Experiment: {}", experiment.name));
            output::print_detail("ID", &experiment.id);
            output::print_detail("Status", &experiment.status);
            output::print_detail("Version", &experiment.version.to_string());
            output::print_detail(
                "Significance",
                &format!("{:.1}%", experiment.statistical_significance),
            );
            if let Some(winner) = winner_name(experiment) {
                output::print_detail("Winner", &winner);
            }
            println!();
            for variant in &experiment.variants {
                let marker = if variant.is_control { " (control)" } else { "" };
                output::print_detail(
                    &format!("{}{}", variant.name, marker),
                    &format!(
                        "{} visitors, {} conversions, {:.2}% rate, {:.1}% confidence",
                        variant.visitors,
                        variant.conversions,
                        variant.conversion_rate * 100.0,
                        variant.confidence
                    ),
                );
            }
        }
        _ => output::print_item(experiment, format),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_variant_with_control_flag() {
        let variant = parse_variant("Control:50:control").unwrap();
        assert_eq!(variant.name, "Control");
        assert_eq!(variant.traffic_percentage, 50.0);
        assert!(variant.is_control);

        let variant = parse_variant("A:50").unwrap();
        assert!(!variant.is_control);
    }

    #[test]
    fn test_parse_variant_rejects_garbage() {
        assert!(parse_variant("NoPercentage").is_err());
        assert!(parse_variant("A:fifty").is_err());
        assert!(parse_variant("A:50:treatment").is_err());
    }

    #[test]
    fn test_parse_metric() {
        let metric = parse_metric("Purchase:conversion:maximize").unwrap();
        assert_eq!(metric.name, "Purchase");
        assert_eq!(metric.metric_type, "conversion");
        assert_eq!(metric.goal, "maximize");

        assert!(parse_metric("Purchase:clicks:maximize").is_err());
        assert!(parse_metric("Purchase:conversion:up").is_err());
        assert!(parse_metric("Purchase").is_err());
    }
}
