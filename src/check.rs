use salesflow_core::config::{AppConfig, OutputFormat};
use salesflow_flow::StepRegistry;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

/// Print config checks and the step graph. Returns whether every check passed.
pub fn run_check(config: &AppConfig, registry: &StepRegistry) -> bool {
    let checks = vec![
        check_api_key(config),
        check_output_dir(config),
        check_crews(config),
        check_leads(config),
        check_run_log(config),
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;
    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  Steps:");
    print_graph(registry);

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
    fail_count == 0
}

fn print_graph(registry: &StepRegistry) {
    let terminals = registry.terminals();
    let width = registry
        .steps()
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(0);

    for step in registry.steps() {
        let marker = if terminals.contains(&step.name.as_str()) {
            " (terminal)"
        } else {
            ""
        };
        println!(
            "    {:<width$}  {}{}",
            step.name,
            step.trigger,
            marker,
            width = width
        );
        if let Some(ref description) = step.description {
            println!("    {:<width$}    {}", "", description, width = width);
        }
    }
}

fn check_api_key(config: &AppConfig) -> CheckResult {
    let has_key = config
        .model
        .api_key
        .as_ref()
        .map_or(false, |k| !k.is_empty() && !k.starts_with("${"));
    let provider = &config.model.provider;
    let needs_key = provider != "ollama";

    if !needs_key || has_key {
        CheckResult {
            label: "API Key".into(),
            ok: true,
            detail: format!("Configured for {} ({})", config.model.model_id, provider),
        }
    } else {
        CheckResult {
            label: "API Key".into(),
            ok: false,
            detail: format!("No API key set for provider '{}'", provider),
        }
    }
}

fn check_output_dir(config: &AppConfig) -> CheckResult {
    let dir = config.output_dir();
    if let Err(e) = std::fs::create_dir_all(&dir) {
        return CheckResult {
            label: "Output".into(),
            ok: false,
            detail: format!("{} (cannot create: {})", dir.display(), e),
        };
    }

    let probe = dir.join(".check_probe");
    match std::fs::write(&probe, "probe") {
        Ok(_) => {
            std::fs::remove_file(&probe).ok();
            CheckResult {
                label: "Output".into(),
                ok: true,
                detail: format!("{}", dir.display()),
            }
        }
        Err(e) => CheckResult {
            label: "Output".into(),
            ok: false,
            detail: format!("{} (not writable: {})", dir.display(), e),
        },
    }
}

fn check_crews(config: &AppConfig) -> CheckResult {
    let summary: Vec<String> = config
        .crews
        .iter()
        .map(|(name, crew)| {
            let structured = crew
                .tasks
                .iter()
                .filter(|t| t.output == OutputFormat::Json)
                .count();
            format!(
                "{} ({} agents, {} tasks, {} structured)",
                name,
                crew.agents.len(),
                crew.tasks.len(),
                structured
            )
        })
        .collect();

    CheckResult {
        label: "Crews".into(),
        ok: true,
        detail: summary.join(", "),
    }
}

fn check_leads(config: &AppConfig) -> CheckResult {
    if config.leads.is_empty() {
        CheckResult {
            label: "Leads".into(),
            ok: false,
            detail: "No leads configured; a run would score nothing".into(),
        }
    } else {
        CheckResult {
            label: "Leads".into(),
            ok: true,
            detail: format!(
                "{} leads, threshold {}",
                config.leads.len(),
                config.pipeline.score_threshold
            ),
        }
    }
}

fn check_run_log(config: &AppConfig) -> CheckResult {
    match config.log_dir() {
        Some(dir) => CheckResult {
            label: "Run log".into(),
            ok: true,
            detail: format!("{}", dir.display()),
        },
        None => CheckResult {
            label: "Run log".into(),
            ok: true,
            detail: "Disabled".into(),
        },
    }
}
