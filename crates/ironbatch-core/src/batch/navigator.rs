//! Model navigator: resolves the next execution element from an exit status.
//!
//! Transition rules are scanned in two passes. The first pass looks for a
//! wildcard-free `on` equal to the exit status; only when none matches does
//! the second pass try the wildcard patterns in declaration order. Failing
//! both, the element's `next` attribute applies, and otherwise the enclosing
//! flow ends.

use ironbatch_types::model::{ExecutionElement, Transition, TransitionAction};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NavigatorError {
    #[error("element '{from}' transitions to unknown element '{target}'")]
    UnknownElement { from: String, target: String },

    #[error("flow has no elements")]
    Empty,
}

/// Where control goes after an element finishes.
#[derive(Debug, Clone, PartialEq)]
pub enum Navigation<'a> {
    Next(&'a ExecutionElement),
    End { exit_status: Option<String> },
    Fail { exit_status: Option<String> },
    Stop {
        exit_status: Option<String>,
        restart: Option<String>,
    },
    /// No rule and no `next` attribute: the enclosing flow (or job) is done.
    EndOfFlow,
}

/// Navigates one list of sibling elements (a job's top level or a flow body).
#[derive(Debug, Clone, Copy)]
pub struct ModelNavigator<'a> {
    elements: &'a [ExecutionElement],
    first: Option<&'a str>,
}

impl<'a> ModelNavigator<'a> {
    pub fn new(elements: &'a [ExecutionElement]) -> Self {
        Self {
            elements,
            first: None,
        }
    }

    /// Navigator whose entry point is `first` rather than the first element.
    pub fn with_first(elements: &'a [ExecutionElement], first: Option<&'a str>) -> Self {
        Self { elements, first }
    }

    pub fn element(&self, id: &str) -> Option<&'a ExecutionElement> {
        self.elements.iter().find(|e| e.id() == id)
    }

    pub fn first(&self) -> Result<&'a ExecutionElement, NavigatorError> {
        match self.first {
            Some(id) => self.element(id).ok_or_else(|| NavigatorError::UnknownElement {
                from: "<start>".to_string(),
                target: id.to_string(),
            }),
            None => self.elements.first().ok_or(NavigatorError::Empty),
        }
    }

    /// Resolve the transition taken when `current` finishes with `exit_status`.
    pub fn next(
        &self,
        current: &ExecutionElement,
        exit_status: &str,
    ) -> Result<Navigation<'a>, NavigatorError> {
        if let Some(rule) = match_transition(current.transitions(), exit_status) {
            return self.follow(current, &rule.action);
        }
        match current.next() {
            Some(target) => self.resolve(current, target).map(Navigation::Next),
            None => Ok(Navigation::EndOfFlow),
        }
    }

    /// Like [`next`](Self::next) but ignores the `next` attribute.
    ///
    /// Used for failed elements, which only move on through an explicit rule.
    pub fn next_on_failure(
        &self,
        current: &ExecutionElement,
        exit_status: &str,
    ) -> Result<Option<Navigation<'a>>, NavigatorError> {
        match match_transition(current.transitions(), exit_status) {
            Some(rule) => self.follow(current, &rule.action).map(Some),
            None => Ok(None),
        }
    }

    fn follow(
        &self,
        current: &ExecutionElement,
        action: &TransitionAction,
    ) -> Result<Navigation<'a>, NavigatorError> {
        Ok(match action {
            TransitionAction::Next { to } => Navigation::Next(self.resolve(current, to)?),
            TransitionAction::End { exit_status } => Navigation::End {
                exit_status: exit_status.clone(),
            },
            TransitionAction::Fail { exit_status } => Navigation::Fail {
                exit_status: exit_status.clone(),
            },
            TransitionAction::Stop {
                exit_status,
                restart,
            } => Navigation::Stop {
                exit_status: exit_status.clone(),
                restart: restart.clone(),
            },
        })
    }

    fn resolve(
        &self,
        current: &ExecutionElement,
        target: &str,
    ) -> Result<&'a ExecutionElement, NavigatorError> {
        self.element(target)
            .ok_or_else(|| NavigatorError::UnknownElement {
                from: current.id().to_string(),
                target: target.to_string(),
            })
    }
}

/// The rule `exit_status` selects, exact matches first.
pub fn match_transition<'t>(rules: &'t [Transition], exit_status: &str) -> Option<&'t Transition> {
    rules
        .iter()
        .find(|rule| !has_wildcard(&rule.on) && rule.on == exit_status)
        .or_else(|| {
            rules
                .iter()
                .find(|rule| has_wildcard(&rule.on) && matches_exit_status(&rule.on, exit_status))
        })
}

pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

/// Case-sensitive glob match: `*` matches any run of characters (including
/// none), `?` matches exactly one.
pub fn matches_exit_status(pattern: &str, exit_status: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = exit_status.chars().collect();

    let (mut p, mut t) = (0, 0);
    // Position after the last `*` seen, and the text index it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                p += 1;
                backtrack = Some((p, t));
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star_p, star_t)) => {
                    p = star_p;
                    t = star_t + 1;
                    backtrack = Some((star_p, star_t + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironbatch_types::model::{StepModel, Transition};

    fn step(id: &str) -> StepModel {
        StepModel::batchlet(id, "noop")
    }

    fn elements() -> Vec<ExecutionElement> {
        vec![
            ExecutionElement::Step(
                step("a")
                    .then("c")
                    .on(Transition::next("*", "b"))
                    .on(Transition::next("DONE", "c"))
                    .on(Transition::fail("BAD?", Some("BROKEN")))
                    .on(Transition::stop("HALT", None, Some("b"))),
            ),
            ExecutionElement::Step(step("b").then("c")),
            ExecutionElement::Step(step("c")),
        ]
    }

    #[test]
    fn wildcard_matching() {
        assert!(matches_exit_status("*", ""));
        assert!(matches_exit_status("*", "ANYTHING"));
        assert!(matches_exit_status("COMP*", "COMPLETED"));
        assert!(matches_exit_status("C?MPLETED", "COMPLETED"));
        assert!(matches_exit_status("*ED", "FAILED"));
        assert!(matches_exit_status("A*B*C", "AxxBxxBxC"));
        assert!(!matches_exit_status("?", ""));
        assert!(!matches_exit_status("COMP*", "comPLETED"));
        assert!(!matches_exit_status("A*B", "AxxBx"));
    }

    #[test]
    fn exact_match_beats_earlier_wildcard() {
        let els = elements();
        let nav = ModelNavigator::new(&els);
        let a = nav.first().unwrap();

        assert_eq!(nav.next(a, "DONE").unwrap(), Navigation::Next(&els[2]));
        assert_eq!(nav.next(a, "OTHER").unwrap(), Navigation::Next(&els[1]));
    }

    #[test]
    fn terminating_transitions() {
        let els = elements();
        let nav = ModelNavigator::new(&els);
        let a = &els[0];

        // "BAD?" is a wildcard but "*" comes first in declaration order.
        assert_eq!(nav.next(a, "BAD1").unwrap(), Navigation::Next(&els[1]));
        assert_eq!(
            nav.next(a, "HALT").unwrap(),
            Navigation::Stop {
                exit_status: None,
                restart: Some("b".to_string())
            }
        );
    }

    #[test]
    fn next_attribute_then_end_of_flow() {
        let els = elements();
        let nav = ModelNavigator::new(&els);
        assert_eq!(nav.next(&els[1], "COMPLETED").unwrap(), Navigation::Next(&els[2]));
        assert_eq!(nav.next(&els[2], "COMPLETED").unwrap(), Navigation::EndOfFlow);
    }

    #[test]
    fn navigator_only_returns_declared_targets() {
        let els = vec![
            ExecutionElement::Step(step("a").on(Transition::next("*", "ghost"))),
            ExecutionElement::Step(step("b")),
        ];
        let nav = ModelNavigator::new(&els);
        let err = nav.next(&els[0], "COMPLETED").unwrap_err();
        assert_eq!(
            err,
            NavigatorError::UnknownElement {
                from: "a".to_string(),
                target: "ghost".to_string()
            }
        );

        for status in ["COMPLETED", "FAILED", "X"] {
            if let Ok(Navigation::Next(target)) = nav.next(&els[1], status) {
                assert!(els.iter().any(|e| std::ptr::eq(e, target)));
            }
        }
    }

    #[test]
    fn failure_ignores_next_attribute() {
        let els = elements();
        let nav = ModelNavigator::new(&els);
        assert_eq!(nav.next_on_failure(&els[1], "FAILED").unwrap(), None);
        assert_eq!(
            nav.next_on_failure(&els[0], "FAILED").unwrap(),
            Some(Navigation::Next(&els[1]))
        );
    }

    #[test]
    fn with_first_selects_named_entry() {
        let els = elements();
        let nav = ModelNavigator::with_first(&els, Some("b"));
        assert_eq!(nav.first().unwrap().id(), "b");
        assert!(ModelNavigator::with_first(&els, Some("zzz")).first().is_err());
        assert_eq!(ModelNavigator::new(&[]).first().unwrap_err(), NavigatorError::Empty);
    }
}
