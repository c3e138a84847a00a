//! 内置模式：research / rfp_sow / itops

use serde_json::json;

use super::catalog::{Mode, ModeConfig};
use crate::engine::{ConfigMap, EngineType};

fn config_map(value: serde_json::Value) -> ConfigMap {
    match value {
        serde_json::Value::Object(map) => map,
        _ => ConfigMap::new(),
    }
}

fn tags(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn research() -> Mode {
    Mode {
        id: "research".into(),
        name: "Scientific Research".into(),
        description: "Generate research ideas, develop methodologies, execute experiments, and write scientific papers"
            .into(),
        category: "research".into(),
        engine: EngineType::Denario,
        tags: tags(&["science", "research", "automation", "paper"]),
        config: ModeConfig {
            engine_config: config_map(json!({
                "backend": "fast",
                "clear_project_dir": false,
            })),
            timeout_minutes: 120,
            max_retries: 2,
            allow_intervention: true,
            intervention_points: vec!["after_idea".into(), "after_methodology".into()],
        },
    }
}

pub fn rfp_sow() -> Mode {
    Mode {
        id: "rfp_sow".into(),
        name: "RFP/SOW Intelligence".into(),
        description: "Analyze RFP/SOW documents and generate cloud architecture proposals with cost estimates".into(),
        category: "analysis".into(),
        engine: EngineType::CmbAgent,
        tags: tags(&["rfp", "architecture", "cloud"]),
        config: ModeConfig {
            engine_config: config_map(json!({
                "workflow_stages": ["analysis", "architecture", "costing", "planning"],
            })),
            ..ModeConfig::default()
        },
    }
}

pub fn itops() -> Mode {
    Mode {
        id: "itops".into(),
        name: "ITOps Ticket Analysis".into(),
        description: "Analyze IT support tickets to identify patterns, root causes, and generate insights".into(),
        category: "analysis".into(),
        engine: EngineType::CmbAgent,
        tags: tags(&["itops", "tickets", "analysis"]),
        config: ModeConfig {
            engine_config: config_map(json!({
                "workflow_stages": ["data_analysis", "pattern_detection", "visualization", "recommendations"],
            })),
            ..ModeConfig::default()
        },
    }
}

pub fn builtin_modes() -> Vec<Mode> {
    vec![research(), rfp_sow(), itops()]
}
