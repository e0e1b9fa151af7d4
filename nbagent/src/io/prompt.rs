//! Prompt builder for the generate and critique characters.
//!
//! Every call produces exactly two messages: a system message (fixed
//! instructions for the character plus an optional domain addendum) and a user
//! message (task statement, state preamble, rendered document, postamble).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::actions::{action_grammar, critique_grammar};
use crate::core::content::{ContentBlock, Message, Role};

const GENERATE_TEMPLATE: &str = include_str!("prompts/generate.md");
const CRITIQUE_TEMPLATE: &str = include_str!("prompts/critique.md");

pub const STATE_PREAMBLE: &str = "\nThe following is the current state of the notebook:\n```\n";
pub const STATE_POSTAMBLE: &str = "\n```\n";

/// Instruction mode selecting the system prompt body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Character {
    #[default]
    Generate,
    Critique,
}

impl Character {
    fn template_name(self) -> &'static str {
        match self {
            Character::Generate => "generate",
            Character::Critique => "critique",
        }
    }

    fn grammar(self) -> String {
        match self {
            Character::Generate => action_grammar(),
            Character::Critique => critique_grammar(),
        }
    }
}

/// Stateless prompt composer.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    addendum: String,
}

impl PromptBuilder {
    /// Create a builder with a domain-specific addendum appended to every
    /// system message. An empty addendum is omitted.
    pub fn new(addendum: impl Into<String>) -> Self {
        Self {
            addendum: addendum.into(),
        }
    }

    /// Build the addendum from an API guide file, when one is configured.
    pub fn from_guide(guide_path: Option<&Path>) -> Result<Self> {
        let Some(path) = guide_path else {
            return Ok(Self::default());
        };
        let guide = fs::read_to_string(path)
            .with_context(|| format!("read API guide {}", path.display()))?;
        debug!(path = %path.display(), bytes = guide.len(), "loaded API guide");
        Ok(Self::new(format!(
            "\nThe following is the API guide available inside the notebook:\n{}\n",
            guide.trim()
        )))
    }

    pub fn addendum(&self) -> &str {
        &self.addendum
    }

    /// Compose the system and user messages for one completion call.
    pub fn forward(
        &self,
        task: &str,
        rendered: &[ContentBlock],
        character: Character,
    ) -> Result<Vec<Message>> {
        let mut system = vec![ContentBlock::text(render_instructions(character)?)];
        if !self.addendum.trim().is_empty() {
            system.push(ContentBlock::text(self.addendum.clone()));
        }

        let mut user = Vec::with_capacity(rendered.len() + 3);
        user.push(ContentBlock::text(task_statement(task)));
        user.push(ContentBlock::text(STATE_PREAMBLE));
        user.extend(rendered.iter().cloned());
        user.push(ContentBlock::text(STATE_POSTAMBLE));

        Ok(vec![
            Message::new(Role::System, system),
            Message::new(Role::User, user),
        ])
    }
}

fn render_instructions(character: Character) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("generate", GENERATE_TEMPLATE)
        .context("load generate template")?;
    env.add_template("critique", CRITIQUE_TEMPLATE)
        .context("load critique template")?;
    let template = env.get_template(character.template_name())?;
    let rendered = template
        .render(context! { grammar => character.grammar() })
        .with_context(|| format!("render {} template", character.template_name()))?;
    Ok(rendered)
}

fn task_statement(task: &str) -> String {
    format!("\nThe following is the task we need to complete:\n{task}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered_doc() -> Vec<ContentBlock> {
        vec![
            ContentBlock::text("```python\n"),
            ContentBlock::text("# <cell 0>\nhello\n# </cell 0>"),
            ContentBlock::image("data:image/png;base64,AAAA"),
            ContentBlock::text("```"),
        ]
    }

    #[test]
    fn forward_builds_system_then_user() {
        let builder = PromptBuilder::new("API guide here");
        let messages = builder
            .forward("plot sleep", &rendered_doc(), Character::Generate)
            .expect("forward");

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content.len(), 2);
        assert_eq!(messages[0].content[1].as_text(), Some("API guide here"));

        let user = &messages[1];
        assert_eq!(user.role, Role::User);
        assert!(user.content[0].as_text().expect("task").contains("plot sleep"));
        assert_eq!(user.content[1].as_text(), Some(STATE_PREAMBLE));
        assert_eq!(&user.content[2..6], rendered_doc().as_slice());
        assert_eq!(user.content[6].as_text(), Some(STATE_POSTAMBLE));
    }

    #[test]
    fn characters_use_disjoint_instructions() {
        let builder = PromptBuilder::default();
        let generate = builder
            .forward("t", &[], Character::Generate)
            .expect("generate");
        let critique = builder
            .forward("t", &[], Character::Critique)
            .expect("critique");

        let generate_text = generate[0].content[0].as_text().expect("text");
        let critique_text = critique[0].content[0].as_text().expect("text");
        assert!(generate_text.contains("<add_cell>"));
        assert!(!generate_text.contains("<feedback>"));
        assert!(critique_text.contains("<feedback>"));
        assert!(!critique_text.contains("<add_cell>"));
        // Empty addendum is omitted.
        assert_eq!(generate[0].content.len(), 1);
    }

    #[test]
    fn default_character_is_generate() {
        assert_eq!(Character::default(), Character::Generate);
    }

    #[test]
    fn guide_file_becomes_addendum() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("guide.md");
        fs::write(&path, "api.get_sleep_data(date)\n").expect("write");
        let builder = PromptBuilder::from_guide(Some(&path)).expect("builder");
        assert!(builder.addendum().contains("api.get_sleep_data(date)"));

        let missing = PromptBuilder::from_guide(Some(&temp.path().join("nope.md")));
        assert!(missing.is_err());
        assert_eq!(PromptBuilder::from_guide(None).expect("none").addendum(), "");
    }
}
