//! Positional classification of the variables of a basic graph pattern.

use rustc_hash::{FxHashMap, FxHashSet};
use spargebra::term::{NamedNodePattern, TermPattern, TriplePattern};
use oxrdf::Variable;

/// How a variable is used across a basic graph pattern.
///
/// A variable that is ever a subject must bind to a resource and is
/// [`Node`](VariableRole::Node), whatever its other occurrences. A
/// variable only seen in object position may bind to a resource or a
/// literal and is [`Ambiguous`](VariableRole::Ambiguous). A variable
/// only seen in predicate position is [`Predicate`](VariableRole::Predicate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VariableRole {
    Node,
    Predicate,
    Ambiguous,
}

/// The result of analyzing one basic graph pattern. Pure data, no I/O.
#[derive(Debug, Default)]
pub(crate) struct BgpAnalysis {
    roles: FxHashMap<Variable, VariableRole>,
    predicate_variables: FxHashSet<Variable>,
}

impl BgpAnalysis {
    pub(crate) fn role(&self, variable: &Variable) -> Option<VariableRole> {
        self.roles.get(variable).copied()
    }

    /// Whether the variable appears in predicate position anywhere,
    /// including when it also has a subject/object role.
    pub(crate) fn is_predicate(&self, variable: &Variable) -> bool {
        self.predicate_variables.contains(variable)
    }

    pub(crate) fn has_predicate_variables(&self) -> bool {
        !self.predicate_variables.is_empty()
    }

    pub(crate) fn ambiguous_variables(&self) -> impl Iterator<Item = &Variable> {
        self.roles
            .iter()
            .filter(|(_, role)| **role == VariableRole::Ambiguous)
            .map(|(variable, _)| variable)
    }
}

/// Classifies every variable of the pattern by its positional usage.
pub(crate) fn analyze_bgp(patterns: &[TriplePattern]) -> BgpAnalysis {
    let mut analysis = BgpAnalysis::default();
    for pattern in patterns {
        if let TermPattern::Variable(v) = &pattern.subject {
            analysis.roles.insert(v.clone(), VariableRole::Node);
        }
        if let NamedNodePattern::Variable(v) = &pattern.predicate {
            analysis.predicate_variables.insert(v.clone());
        }
        if let TermPattern::Variable(v) = &pattern.object {
            analysis
                .roles
                .entry(v.clone())
                .or_insert(VariableRole::Ambiguous);
        }
    }
    for variable in &analysis.predicate_variables {
        analysis
            .roles
            .entry(variable.clone())
            .or_insert(VariableRole::Predicate);
    }
    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxrdf::NamedNode;

    fn var(name: &str) -> Variable {
        Variable::new_unchecked(name)
    }

    fn triple(
        subject: impl Into<TermPattern>,
        predicate: impl Into<NamedNodePattern>,
        object: impl Into<TermPattern>,
    ) -> TriplePattern {
        TriplePattern {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }

    #[test]
    fn subject_occurrence_dominates() {
        let knows = NamedNode::new_unchecked("http://example.com/knows");
        // ?b is an object in the first triple and a subject in the second.
        let analysis = analyze_bgp(&[
            triple(var("a"), knows.clone(), var("b")),
            triple(var("b"), knows, var("c")),
        ]);
        assert_eq!(analysis.role(&var("a")), Some(VariableRole::Node));
        assert_eq!(analysis.role(&var("b")), Some(VariableRole::Node));
        assert_eq!(analysis.role(&var("c")), Some(VariableRole::Ambiguous));
    }

    #[test]
    fn predicate_only_variables_are_predicates() {
        let analysis = analyze_bgp(&[triple(var("s"), var("p"), var("o"))]);
        assert_eq!(analysis.role(&var("p")), Some(VariableRole::Predicate));
        assert!(analysis.is_predicate(&var("p")));
        assert!(analysis.has_predicate_variables());
    }

    #[test]
    fn predicate_role_may_overlap_with_positional_roles() {
        let knows = NamedNode::new_unchecked("http://example.com/knows");
        let analysis = analyze_bgp(&[
            triple(var("s"), var("x"), var("o")),
            triple(var("x"), knows, var("o")),
        ]);
        assert_eq!(analysis.role(&var("x")), Some(VariableRole::Node));
        assert!(analysis.is_predicate(&var("x")));
    }

    #[test]
    fn analysis_is_deterministic() {
        let knows = NamedNode::new_unchecked("http://example.com/knows");
        let patterns = [
            triple(var("a"), knows.clone(), var("b")),
            triple(var("b"), knows, var("a")),
        ];
        let first = analyze_bgp(&patterns);
        let second = analyze_bgp(&patterns);
        assert_eq!(first.role(&var("a")), second.role(&var("a")));
        assert_eq!(first.role(&var("b")), second.role(&var("b")));
    }
}
