//! # Program
//! A program is an ordered list of [Turn]s. A turn is a template: literal text spans interleaved with [Node]s, where
//! a node is a named or unnamed [Slot], a nested turn, or a reference to a caller input.
//!
//! ## Authoring
//! Turns are written with a [TurnBuilder],
//!
//! ```
//! use slotgen::program::Turn;
//! use slotgen::slot::Slot;
//! # fn main() -> slotgen::Result<()> {
//! let turn = Turn::assistant()
//!     .text("The quick ")
//!     .slot("color", Slot::select(["brown", "red"])?)
//!     .text(" fox jumped.")
//!     .try_build()?;
//! assert_eq!(vec!["The quick ", " fox jumped."], turn.literals);
//! # Ok(())
//! # }
//! ```
//!
//! or from a template string, in which a placeholder has the format `{[name]}`. Placeholders bound to a slot become
//! named slots; all others are inputs that the caller supplies at evaluation time.
//!
//! ```
//! use slotgen::program::Turn;
//! use slotgen::slot::Slot;
//! let turn = Turn::from_template(None, "Hello {[user]}, you look {[mood]}.", [
//!     ("mood", Slot::select(["happy", "tired"]).unwrap()),
//! ]).unwrap();
//! assert_eq!(["user"], turn.inputs().as_slice());
//! ```
//!
//! Literal spans are trimmed of template indentation once, when the turn is built, see [trim_template].
//!
//! Programs and turns are immutable after construction.

use std::collections::{HashMap, HashSet};
use log::warn;

use crate::error::{Error, Result};
use crate::slot::{Slot, SlotKind};
use crate::utils::llm::Role;
use crate::utils::string::{get_placeholders, split_template};
use crate::utils::trim::trim_template;

/// A node between two literal spans.
#[derive(Debug, Clone)]
pub enum Node {
    Slot { name: Option<String>, slot: Slot },
    Turn(Turn),
    Input(String),
}

/// A borrowed view of one piece of a turn, in template order.
#[derive(Debug, Clone, Copy)]
pub enum Segment<'a> {
    Literal(&'a str),
    Slot { name: Option<&'a str>, slot: &'a Slot },
    Repeat { name: Option<&'a str>, length: usize, body: &'a Turn },
    Turn(&'a Turn),
    Input(&'a str),
}

/// A role-tagged template. There is always one more literal span than there are nodes.
#[derive(Debug, Clone)]
#[readonly::make]
pub struct Turn {
    /// Role of the turn. Without one, the turn takes the role of the enclosing turn.
    #[readonly]
    pub role: Option<Role>,
    #[readonly]
    pub literals: Vec<String>,
    #[readonly]
    pub nodes: Vec<Node>,
}

impl Turn {
    /// Start building a turn without a role.
    pub fn builder() -> TurnBuilder {
        TurnBuilder::new(None)
    }

    pub fn system() -> TurnBuilder {
        TurnBuilder::new(Some(Role::System))
    }

    pub fn user() -> TurnBuilder {
        TurnBuilder::new(Some(Role::User))
    }

    pub fn assistant() -> TurnBuilder {
        TurnBuilder::new(Some(Role::Assistant))
    }

    /// Create a turn from literal spans and nodes. Fails if the spans do not surround the nodes.
    pub fn new(role: Option<Role>, literals: Vec<String>, nodes: Vec<Node>) -> Result<Self> {
        if literals.len() != nodes.len() + 1 {
            return Err(Error::InvalidTemplate(format!(
                "{} nodes need {} literal spans, got {}", nodes.len(), nodes.len() + 1, literals.len())));
        }
        let mut seen = HashSet::new();
        for name in reported_names(&nodes) {
            if !seen.insert(name) {
                return Err(Error::InvalidTemplate(format!("slot `{}` appears more than once", name)));
            }
        }
        Ok(Self {
            role,
            literals: trim_template(&literals),
            nodes,
        })
    }

    /// Create a turn from a `{[name]}` template. Placeholders named in `slots` become slots, the others inputs.
    pub fn from_template<I, S>(role: Option<Role>, template: &str, slots: I) -> Result<Self>
        where I: IntoIterator<Item=(S, Slot)>,
              S: Into<String> {
        let mut slots: HashMap<String, Slot> = slots.into_iter()
            .map(|(name, slot)| (name.into(), slot))
            .collect();
        let placeholders = get_placeholders(template);
        for unused in slots.keys().filter(|name| !placeholders.contains(*name)) {
            warn!("Slot `{}` is not used by the template. Check whether you have written placeholders correctly.\n\
            Got template:\n\
            {}", unused, template);
        }
        let split = split_template(template);
        let nodes = split.placeholders
            .into_iter()
            .map(|name| match slots.remove(&name) {
                Some(slot) => Node::Slot { name: Some(name), slot },
                None => Node::Input(name),
            })
            .collect::<Vec<_>>();
        let nodes = reject_rebound_slots(nodes, template)?;
        Self::new(role, split.literals, nodes)
    }

    /// Pieces of the turn in template order.
    pub fn segments(&self) -> Vec<Segment<'_>> {
        let mut segments = Vec::with_capacity(self.literals.len() + self.nodes.len());
        for (literal, node) in self.literals.iter().zip(self.nodes.iter().map(Some).chain([None])) {
            segments.push(Segment::Literal(literal));
            let Some(node) = node else {
                break;
            };
            segments.push(match node {
                Node::Slot { name, slot } => match &slot.kind {
                    SlotKind::Repeat { length, body } => Segment::Repeat {
                        name: name.as_deref(),
                        length: *length,
                        body,
                    },
                    _ => Segment::Slot {
                        name: name.as_deref(),
                        slot,
                    },
                },
                Node::Turn(turn) => Segment::Turn(turn),
                Node::Input(name) => Segment::Input(name),
            });
        }
        segments
    }

    /// Number of slots directly in this turn, not counting nested turns.
    pub fn slot_count(&self) -> usize {
        self.nodes.iter().filter(|node| matches!(node, Node::Slot { .. })).count()
    }

    /// Names of the inputs referenced by this turn and its nested turns.
    pub fn inputs(&self) -> Vec<&str> {
        let mut inputs = Vec::new();
        for node in &self.nodes {
            match node {
                Node::Input(name) => inputs.push(name.as_str()),
                Node::Turn(turn) => inputs.extend(turn.inputs()),
                Node::Slot { slot, .. } => {
                    if let SlotKind::Repeat { body, .. } = &slot.kind {
                        inputs.extend(body.inputs());
                    }
                }
            }
        }
        inputs
    }

    /// Names of the slots reported by this turn: its own named slots and those of nested turns.
    /// Slots inside repeat bodies are reported inside the repeat value instead.
    pub fn slot_names(&self) -> Vec<&str> {
        reported_names(&self.nodes)
    }
}

fn reported_names(nodes: &[Node]) -> Vec<&str> {
    let mut names = Vec::new();
    for node in nodes {
        match node {
            Node::Slot { name: Some(name), .. } => names.push(name.as_str()),
            Node::Turn(turn) => names.extend(turn.slot_names()),
            _ => {}
        }
    }
    names
}

/// A placeholder bound to a slot must not appear again, the later occurrences would read as inputs.
fn reject_rebound_slots(nodes: Vec<Node>, template: &str) -> Result<Vec<Node>> {
    let slot_names: HashSet<&str> = nodes.iter()
        .filter_map(|node| match node {
            Node::Slot { name: Some(name), .. } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    if let Some(name) = nodes.iter().find_map(|node| match node {
        Node::Input(name) if slot_names.contains(name.as_str()) => Some(name),
        _ => None,
    }) {
        return Err(Error::InvalidTemplate(format!("slot `{}` appears more than once in:\n{}", name, template)));
    }
    Ok(nodes)
}

/// Builder of a [Turn]. Text pushed between two nodes is concatenated into one literal span.
#[derive(Debug, Clone)]
pub struct TurnBuilder {
    role: Option<Role>,
    literals: Vec<String>,
    nodes: Vec<Node>,
}

impl TurnBuilder {
    fn new(role: Option<Role>) -> Self {
        Self {
            role,
            literals: vec![String::new()],
            nodes: Vec::new(),
        }
    }

    fn push(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self.literals.push(String::new());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        if let Some(literal) = self.literals.last_mut() {
            literal.push_str(text);
        }
        self
    }

    pub fn slot(self, name: impl Into<String>, slot: Slot) -> Self {
        self.push(Node::Slot {
            name: Some(name.into()),
            slot,
        })
    }

    pub fn slot_unnamed(self, slot: Slot) -> Self {
        self.push(Node::Slot { name: None, slot })
    }

    pub fn turn(self, turn: Turn) -> Self {
        self.push(Node::Turn(turn))
    }

    pub fn input(self, name: impl Into<String>) -> Self {
        self.push(Node::Input(name.into()))
    }

    /// Finish the turn. Fails if a slot name is used twice.
    pub fn try_build(self) -> Result<Turn> {
        Turn::new(self.role, self.literals, self.nodes)
    }

    /// Finish a turn whose slot names are known to be unique, as in tests and fixed programs.
    ///
    /// # Panics
    /// If a slot name is used twice. Use [TurnBuilder::try_build] for turns assembled at runtime.
    pub fn build(self) -> Turn {
        match self.try_build() {
            Ok(turn) => turn,
            Err(error) => panic!("{}", error),
        }
    }
}

/// An ordered list of turns.
#[derive(Debug, Clone)]
#[readonly::make]
pub struct Program {
    #[readonly]
    pub turns: Vec<Turn>,
}

impl Program {
    /// Create a program. Fails if two turns report a slot with the same name.
    pub fn new(turns: Vec<Turn>) -> Result<Self> {
        let mut seen = HashSet::new();
        for name in turns.iter().flat_map(Turn::slot_names) {
            if !seen.insert(name) {
                return Err(Error::InvalidTemplate(format!("slot `{}` is declared by more than one turn", name)));
            }
        }
        Ok(Self { turns })
    }

    /// All inputs the program needs from the caller.
    pub fn inputs(&self) -> HashSet<&str> {
        self.turns.iter().flat_map(Turn::inputs).collect()
    }
}

impl From<Turn> for Program {
    fn from(turn: Turn) -> Self {
        Self { turns: vec![turn] }
    }
}

#[cfg(test)]
mod test_program {
    use crate::error::Error;
    use crate::slot::Slot;
    use crate::utils::llm::Role;
    use super::{Node, Program, Segment, Turn};

    fn select(items: &[&str]) -> Slot {
        Slot::select(items.iter().copied()).unwrap()
    }

    #[test]
    fn test_builder_layout() {
        let turn = Turn::assistant()
            .text("The quick ")
            .slot("color", select(&["brown", "red"]))
            .text(" ")
            .slot("animal", select(&["fox", "dog", "cat"]))
            .text(" jumped.")
            .build();
        assert_eq!(Some(Role::Assistant), turn.role);
        assert_eq!(vec!["The quick ", " ", " jumped."], turn.literals);
        assert_eq!(2, turn.slot_count());
        assert_eq!(vec!["color", "animal"], turn.slot_names());
        let segments = turn.segments();
        assert_eq!(5, segments.len());
        assert!(matches!(segments[0], Segment::Literal("The quick ")));
        assert!(matches!(segments[1], Segment::Slot { name: Some("color"), .. }));
        assert!(matches!(segments[4], Segment::Literal(" jumped.")));
    }

    #[test]
    fn test_builder_trims() {
        let turn = Turn::builder()
            .text("\n    name: \"")
            .slot("name", Slot::string())
            .text("\",\n    age: ")
            .slot("age", Slot::range(1, 100).unwrap())
            .text("\n")
            .build();
        assert_eq!(vec!["name: \"", "\",\nage: ", "\n"], turn.literals);
    }

    #[test]
    fn test_from_template() {
        let turn = Turn::from_template(Some(Role::User), "Hi {[user]}! Pick {[armor]} or {[user]}.", [
            ("armor", select(&["leather", "plate"])),
        ]).unwrap();
        assert_eq!(vec!["Hi ", "! Pick ", " or ", "."], turn.literals);
        assert_eq!(vec!["user", "user"], turn.inputs());
        assert_eq!(vec!["armor"], turn.slot_names());
        assert!(matches!(&turn.nodes[1], Node::Slot { name: Some(name), .. } if name == "armor"));
    }

    #[test]
    fn test_slot_bound_twice() {
        let error = Turn::from_template(None, "{[a]} and {[a]}", [("a", Slot::string())])
            .expect_err("a slot cannot be generated twice");
        assert!(matches!(error, Error::InvalidTemplate(_)));
        let error = Turn::builder()
            .slot("a", Slot::string())
            .slot("a", Slot::number())
            .try_build()
            .expect_err("a slot cannot be generated twice");
        assert!(matches!(error, Error::InvalidTemplate(_)));
    }

    #[test]
    #[should_panic(expected = "InvalidTemplate")]
    fn test_build_panics_on_duplicate() {
        Turn::builder()
            .slot("a", Slot::string())
            .slot("a", Slot::number())
            .build();
    }

    #[test]
    fn test_literal_count() {
        assert!(Turn::new(None, vec!["only".to_string()], vec![Node::Input("x".to_string())]).is_err());
    }

    #[test]
    fn test_repeat_segment() {
        let body = Turn::builder().text("\"").slot_unnamed(Slot::string()).text("\",").build();
        let turn = Turn::builder().slot("items", Slot::repeat(3, body).unwrap()).build();
        assert!(matches!(turn.segments()[1], Segment::Repeat { name: Some("items"), length: 3, .. }));
    }

    #[test]
    fn test_program_names() {
        let first = Turn::user().text("Name: ").slot("name", Slot::string()).build();
        let second = Turn::assistant().turn(Turn::builder().slot("name", Slot::string()).build()).build();
        assert!(Program::new(vec![first.clone()]).is_ok());
        assert!(matches!(Program::new(vec![first, second]), Err(Error::InvalidTemplate(_))));
        let program = Program::from(Turn::builder().input("user").build());
        assert!(program.inputs().contains("user"));
    }
}
