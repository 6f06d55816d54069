//! Prompt template collaborator
//!
//! Rendering is a pure function of the prompt and its fields. Embedders plug
//! in their own wording through [`PromptTemplates`].

use serde::{Deserialize, Serialize};

/// Settings forwarded to the scaffolding planner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaffoldSettings {
    pub language: String,
    pub template: String,
    pub package_manager: String,
    pub license: String,
}

/// A prompt to render, with borrowed field values.
#[derive(Debug, Clone, Copy)]
pub enum Prompt<'a> {
    ScaffoldPlan {
        description: &'a str,
        settings: &'a ScaffoldSettings,
    },
    Reasoning {
        problem: &'a str,
    },
    Summary {
        text: &'a str,
    },
    Stakeholders {
        text: &'a str,
    },
    ReadmeSection {
        text: &'a str,
    },
    DocumentSummary {
        text: &'a str,
    },
    DocumentAnalysis {
        text: &'a str,
    },
}

pub trait PromptTemplates: Send + Sync {
    fn render(&self, prompt: &Prompt<'_>) -> String;
}

/// Built-in wording.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTemplates;

impl PromptTemplates for DefaultTemplates {
    fn render(&self, prompt: &Prompt<'_>) -> String {
        match *prompt {
            Prompt::ScaffoldPlan {
                description,
                settings,
            } => format!(
                "You are an expert software architect. Generate a project plan as a single JSON object.\n\n\
                 Project Description: {description}\n\
                 Language: {}\nTemplate: {}\nPackage manager: {}\nLicense: {}",
                settings.language, settings.template, settings.package_manager, settings.license
            ),
            Prompt::Reasoning { problem } => format!(
                "You are an expert problem solver. Provide a step-by-step analysis of the following problem.\n\n\
                 Problem: {problem}"
            ),
            Prompt::Summary { text } => format!("Summarize the following: {text}"),
            Prompt::Stakeholders { text } => format!("Identify stakeholders in: {text}"),
            Prompt::ReadmeSection { text } => format!(
                "You are a technical writer. Generate a README section for the document segment below.\n\n\
                 Document to analyze:\n{text}"
            ),
            Prompt::DocumentSummary { text } => format!("Create a summary of: {text}"),
            Prompt::DocumentAnalysis { text } => {
                format!("Analyze the following document: {text}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_embed_fields() {
        let t = DefaultTemplates;
        let settings = ScaffoldSettings {
            language: "rust".into(),
            template: "axum".into(),
            package_manager: "cargo".into(),
            license: "MIT".into(),
        };
        let plan = t.render(&Prompt::ScaffoldPlan {
            description: "todo api",
            settings: &settings,
        });
        assert!(plan.contains("project plan"));
        assert!(plan.contains("todo api"));
        assert!(plan.contains("axum"));

        let reasoning = t.render(&Prompt::Reasoning { problem: "scale it" });
        assert!(reasoning.contains("step-by-step"));
        assert!(reasoning.ends_with("scale it"));
    }
}
