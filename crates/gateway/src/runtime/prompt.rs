//! System-prompt assembly.
//!
//! Deterministic by construction: the same agent prompt, skills index,
//! and context sections always produce byte-identical output. Sections
//! render in a fixed order with stable headers; empty sections are
//! omitted entirely.

/// A named block of context (workspace notes, tool guidance, etc.).
#[derive(Debug, Clone)]
pub struct PromptSection {
    pub title: String,
    pub body: String,
}

pub struct PromptAssembler {
    agent_prompt: String,
    skills: Vec<PromptSection>,
}

const DEFAULT_AGENT_PROMPT: &str = "You are a careful assistant running inside a local daemon. \
Every action you take is recorded and reversible; prefer small, verifiable steps. \
Use the provided tools; report what you changed.";

impl Default for PromptAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_AGENT_PROMPT.to_owned(), Vec::new())
    }
}

impl PromptAssembler {
    pub fn new(agent_prompt: String, skills: Vec<PromptSection>) -> Self {
        let mut skills = skills;
        // Fixed ordering regardless of registration order.
        skills.sort_by(|a, b| a.title.cmp(&b.title));
        Self {
            agent_prompt,
            skills,
        }
    }

    /// Assemble the system prompt: agent prompt, then the sorted skills
    /// index, then caller-supplied context sections in the order given.
    pub fn assemble(&self, context: &[PromptSection]) -> String {
        let mut out = String::new();
        out.push_str(self.agent_prompt.trim());

        if !self.skills.is_empty() {
            out.push_str("\n\n## Skills\n");
            for skill in &self.skills {
                out.push_str(&format!("- {}: {}\n", skill.title, skill.body.trim()));
            }
        }

        for section in context {
            if section.body.trim().is_empty() {
                continue;
            }
            out.push_str(&format!("\n\n## {}\n{}", section.title, section.body.trim()));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(title: &str, body: &str) -> PromptSection {
        PromptSection {
            title: title.into(),
            body: body.into(),
        }
    }

    #[test]
    fn same_inputs_same_output() {
        let a = PromptAssembler::new("prompt".into(), vec![section("b", "x"), section("a", "y")]);
        let b = PromptAssembler::new("prompt".into(), vec![section("a", "y"), section("b", "x")]);
        let ctx = [section("Workspace", "notes")];
        assert_eq!(a.assemble(&ctx), b.assemble(&ctx));
    }

    #[test]
    fn skills_sorted_by_title() {
        let asm = PromptAssembler::new("p".into(), vec![section("zeta", "1"), section("alpha", "2")]);
        let out = asm.assemble(&[]);
        let alpha = out.find("alpha").unwrap();
        let zeta = out.find("zeta").unwrap();
        assert!(alpha < zeta);
    }

    #[test]
    fn empty_context_sections_omitted() {
        let asm = PromptAssembler::default();
        let out = asm.assemble(&[section("Empty", "   ")]);
        assert!(!out.contains("## Empty"));
    }

    #[test]
    fn context_renders_in_given_order() {
        let asm = PromptAssembler::default();
        let out = asm.assemble(&[section("First", "1"), section("Second", "2")]);
        assert!(out.find("## First").unwrap() < out.find("## Second").unwrap());
    }
}
