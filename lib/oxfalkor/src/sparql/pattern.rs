//! Compilation of the supported SPARQL algebra shapes into single
//! parameterized Cypher statements.
//!
//! Every entry point is total: it returns either a compiled statement
//! with its column typing or an [`Untranslatable`] signal carrying a
//! short reason, never an error. The executor converts the signal
//! into a fallback evaluation.

use crate::sparql::analyzer::{BgpAnalysis, VariableRole, analyze_bgp};
use crate::sparql::expression::{ExprScope, translate_expression};
use crate::sparql::geo::InvalidWktError;
use crate::storage::codec::{ColumnType, DATATYPE_SUFFIX, RESOURCE_LABEL, encode_literal, escape_name};
use crate::storage::driver::CypherValue;
use oxrdf::vocab::rdf;
use oxrdf::{Literal, Variable};
use rustc_hash::FxHashMap;
use spargebra::algebra::{AggregateExpression, AggregateFunction, Expression};
use spargebra::term::{NamedNodePattern, TermPattern, TriplePattern};
use std::fmt;

/// Upper bound on ambiguous variables in a multi-triple pattern; the
/// branch expansion is 2^N.
const MAX_AMBIGUOUS_VARIABLES: usize = 4;

/// The structured "cannot compile" signal.
#[derive(Debug)]
pub(crate) struct Untranslatable {
    /// The algebra node kind that failed, for the fallback log line.
    pub(crate) kind: &'static str,
    pub(crate) reason: String,
    /// Set when the reason is a WKT literal that did not parse.
    pub(crate) invalid_wkt: Option<InvalidWktError>,
}

impl Untranslatable {
    pub(crate) fn new(kind: &'static str, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            invalid_wkt: None,
        }
    }

    pub(crate) fn invalid_wkt(kind: &'static str, error: InvalidWktError) -> Self {
        Self {
            kind,
            reason: error.to_string(),
            invalid_wkt: Some(error),
        }
    }
}

impl fmt::Display for Untranslatable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

/// Allocates statement-unique parameter names. Shared across UNION
/// branches so that no renaming pass is needed: every branch draws
/// from the same counter.
#[derive(Default)]
pub(crate) struct ParamTable {
    params: Vec<(String, CypherValue)>,
}

impl ParamTable {
    /// Registers a value and returns its `$name` reference.
    pub(crate) fn add(&mut self, value: CypherValue) -> String {
        let name = format!("p{}", self.params.len());
        self.params.push((name.clone(), value));
        format!("${name}")
    }

    pub(crate) fn into_params(self) -> Vec<(String, CypherValue)> {
        self.params
    }
}

/// What a SPARQL variable maps to inside the compiled statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum VarBinding {
    /// A node pattern identifier; projected through its `uri`.
    Node(String),
    /// A literal property of a node pattern.
    Property { ident: String, key: String },
    /// An `UNWIND labels(…)` alias standing for an `rdf:type` object.
    Label(String),
}

impl VarBinding {
    /// The Cypher expression that reads the bound value.
    pub(crate) fn cypher_ref(&self) -> String {
        match self {
            Self::Node(ident) => format!("{ident}.uri"),
            Self::Property { ident, key } => format!("{ident}.`{}`", escape_name(key)),
            Self::Label(alias) => alias.clone(),
        }
    }

    fn column_type(&self) -> ColumnType {
        match self {
            Self::Node(_) => ColumnType::NodeUri,
            Self::Property { .. } => ColumnType::LiteralValue,
            Self::Label(_) => ColumnType::TypeLabel,
        }
    }
}

/// How the executor turns result rows into solutions.
#[derive(Debug)]
pub(crate) enum RowPlan {
    /// Plain positional decoding through the branch column typing.
    Columns,
    /// The three-way variable-predicate union; rows need expansion.
    VarPredicate(VarPredicatePlan),
}

/// The three branch families of the variable-predicate union, in the
/// order they appear in the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VarPredicateBranch {
    Edges,
    Properties,
    Labels,
}

#[derive(Debug)]
pub(crate) struct VarPredicatePlan {
    /// Index of the subject variable among `variables`, when variable.
    pub(crate) subject: Option<usize>,
    /// Index of the predicate variable.
    pub(crate) predicate: usize,
    /// Index of the object variable, when variable.
    pub(crate) object: Option<usize>,
    /// Client-side filter when the object is a concrete literal.
    pub(crate) object_literal: Option<Literal>,
    /// Which branch family each discriminator value stands for.
    pub(crate) branch_kinds: Vec<VarPredicateBranch>,
    /// Left-join semantics: unbound rows survive, compensated later.
    pub(crate) optional: bool,
}

/// Compensation metadata for left joins whose optional side compiled
/// into several branches: within each group of identical required
/// bindings, unbound rows only survive when no bound row exists.
#[derive(Debug)]
pub(crate) struct LeftJoinCompensation {
    pub(crate) required: Vec<usize>,
    pub(crate) optional: Vec<usize>,
}

/// A compiled statement together with everything needed to decode its
/// rows.
#[derive(Debug)]
pub(crate) struct CompiledQuery {
    pub(crate) cypher: String,
    pub(crate) params: Vec<(String, CypherValue)>,
    /// The variables physically projected, in column order.
    pub(crate) variables: Vec<Variable>,
    /// Per variable: whether a datatype slot follows the value slot.
    pub(crate) datatype_slots: Vec<bool>,
    /// Per branch, per variable: the decoding rule, `None` when the
    /// branch never binds the variable.
    pub(crate) branches: Vec<Vec<Option<ColumnType>>>,
    pub(crate) row_plan: RowPlan,
    pub(crate) compensation: Option<LeftJoinCompensation>,
}

impl CompiledQuery {
    pub(crate) fn has_discriminator(&self) -> bool {
        match &self.row_plan {
            RowPlan::Columns => self.branches.len() > 1,
            RowPlan::VarPredicate(_) => true,
        }
    }
}

/// Compiles a basic graph pattern.
pub(crate) fn compile_bgp(
    patterns: &[TriplePattern],
    output_variables: &[Variable],
) -> Result<CompiledQuery, Untranslatable> {
    compile_bgp_with_filter(patterns, None, output_variables)
}

/// Compiles a basic graph pattern with a filter expression appended
/// to the outermost `WHERE` of every branch.
pub(crate) fn compile_bgp_with_filter(
    patterns: &[TriplePattern],
    filter: Option<&Expression>,
    output_variables: &[Variable],
) -> Result<CompiledQuery, Untranslatable> {
    let kind = if filter.is_some() { "FILTER" } else { "BGP" };
    let mut params = ParamTable::default();
    let analysis = analyze_bgp(patterns);
    if analysis.has_predicate_variables() {
        if patterns.len() != 1 {
            return Err(Untranslatable::new(
                kind,
                "variable predicates are only supported in single-triple patterns",
            ));
        }
        return compile_var_predicate(
            &patterns[0],
            filter,
            output_variables,
            None,
            false,
            params,
            kind,
        );
    }
    let assignments = ambiguous_assignments(patterns, &analysis, true, kind)?;
    let mut branches = Vec::with_capacity(assignments.len());
    for assignment in &assignments {
        let mut branch = BranchBuilder::new(&analysis, assignment);
        branch.add_patterns(patterns, &mut params, kind)?;
        if let Some(filter) = filter {
            branch.add_filter(filter, &mut params)?;
        }
        branches.push(branch);
    }
    render_branches(branches, output_variables, params, kind)
}

/// Compiles a left join of two basic graph patterns. Each triple of
/// the optional side becomes an `OPTIONAL MATCH`.
pub(crate) fn compile_left_join(
    required: &[TriplePattern],
    optional: &[TriplePattern],
    expression: Option<&Expression>,
    output_variables: &[Variable],
) -> Result<CompiledQuery, Untranslatable> {
    const KIND: &str = "OPTIONAL";
    if expression.is_some() {
        return Err(Untranslatable::new(
            KIND,
            "left join conditions are not supported",
        ));
    }
    let mut params = ParamTable::default();
    let required_analysis = analyze_bgp(required);
    if required_analysis.has_predicate_variables() {
        return Err(Untranslatable::new(
            KIND,
            "variable predicates in the required pattern are not supported",
        ));
    }
    let combined: Vec<TriplePattern> = required.iter().chain(optional).cloned().collect();
    let analysis = analyze_bgp(&combined);
    if analysis.has_predicate_variables() {
        if optional.len() != 1 {
            return Err(Untranslatable::new(
                KIND,
                "variable predicates are only supported in single-triple patterns",
            ));
        }
        let no_assignment = Assignment::default();
        let mut left = BranchBuilder::new(&analysis, &no_assignment);
        left.add_patterns(required, &mut params, KIND)?;
        return compile_var_predicate(
            &optional[0],
            None,
            output_variables,
            Some((left, required_variables(required))),
            true,
            params,
            KIND,
        );
    }
    // Ambiguous variables (on either side) branch the whole
    // statement; the executor compensates the duplicated unbound
    // rows afterwards.
    let assignments = ambiguous_assignments(&combined, &analysis, false, KIND)?;
    let mut branches = Vec::with_capacity(assignments.len());
    for assignment in &assignments {
        let mut branch = BranchBuilder::new(&analysis, assignment);
        branch.add_patterns(required, &mut params, KIND)?;
        branch.add_optional_patterns(optional, &mut params)?;
        branches.push(branch);
    }
    let required_vars = required_variables(required);
    let mut compiled = render_branches(branches, output_variables, params, KIND)?;
    if compiled.has_discriminator() {
        compiled.compensation = Some(compensation_for(&compiled.variables, &required_vars));
    }
    Ok(compiled)
}

/// Compiles a union of basic graph pattern branches, aligning the
/// output columns by variable name.
pub(crate) fn compile_union(
    branches: &[(Vec<TriplePattern>, Option<Expression>)],
    output_variables: &[Variable],
) -> Result<CompiledQuery, Untranslatable> {
    const KIND: &str = "UNION";
    let mut params = ParamTable::default();
    let mut analyses = Vec::with_capacity(branches.len());
    let mut assignments_list = Vec::with_capacity(branches.len());
    for (patterns, _) in branches {
        let analysis = analyze_bgp(patterns);
        if analysis.has_predicate_variables() {
            return Err(Untranslatable::new(
                KIND,
                "variable predicates are only supported in single-triple patterns",
            ));
        }
        let assignments = ambiguous_assignments(patterns, &analysis, true, KIND)?;
        analyses.push(analysis);
        assignments_list.push(assignments);
    }
    let mut built = Vec::new();
    for (i, (patterns, filter)) in branches.iter().enumerate() {
        let analysis = &analyses[i];
        for assignment in &assignments_list[i] {
            let mut branch = BranchBuilder::new(analysis, assignment);
            branch.add_patterns(patterns, &mut params, KIND)?;
            if let Some(filter) = filter {
                branch.add_filter(filter, &mut params)?;
            }
            built.push(branch);
        }
    }
    render_branches(built, output_variables, params, KIND)
}

/// Compiles a `GROUP BY` over a basic graph pattern: the grouping
/// columns followed by the aggregate expressions.
pub(crate) fn compile_group(
    patterns: &[TriplePattern],
    filter: Option<&Expression>,
    group_variables: &[Variable],
    aggregates: &[(Variable, AggregateExpression)],
) -> Result<CompiledQuery, Untranslatable> {
    const KIND: &str = "GROUP";
    let mut params = ParamTable::default();
    let analysis = analyze_bgp(patterns);
    if analysis.has_predicate_variables() {
        return Err(Untranslatable::new(
            KIND,
            "variable predicates are not supported under aggregation",
        ));
    }
    // Aggregation is only meaningful over literal values, so
    // ambiguous variables are fixed to the property side instead of
    // branching the statement.
    let assignment: Assignment = analysis
        .ambiguous_variables()
        .map(|v| (v.clone(), AmbiguousChoice::PropertyValue))
        .collect();
    let mut branch = BranchBuilder::new(&analysis, &assignment);
    branch.add_patterns(patterns, &mut params, KIND)?;
    if let Some(filter) = filter {
        branch.add_filter(filter, &mut params)?;
    }

    let mut variables = Vec::new();
    let mut datatype_slots = Vec::new();
    let mut kinds = Vec::new();
    let mut projections = Vec::new();
    for variable in group_variables {
        let Some(binding) = branch.bindings.get(variable) else {
            return Err(Untranslatable::new(
                KIND,
                format!("grouping variable {variable} is not bound by the pattern"),
            ));
        };
        let column = format!("c{}", variables.len());
        projections.push(format!("{} AS {column}", binding.cypher_ref()));
        let with_datatype = if let VarBinding::Property { ident, key } = binding {
            projections.push(format!(
                "{ident}.`{}{DATATYPE_SUFFIX}` AS {column}_dt",
                escape_name(key)
            ));
            true
        } else {
            false
        };
        kinds.push(Some(binding.column_type()));
        datatype_slots.push(with_datatype);
        variables.push(variable.clone());
    }
    for (variable, aggregate) in aggregates {
        let expression = translate_aggregate(aggregate, &branch, KIND)?;
        let column = format!("c{}", variables.len());
        projections.push(format!("{expression} AS {column}"));
        kinds.push(Some(ColumnType::LiteralValue));
        datatype_slots.push(false);
        variables.push(variable.clone());
    }
    let cypher = format!("{} RETURN {}", branch.render_clauses(), projections.join(", "));
    Ok(CompiledQuery {
        cypher,
        params: params.into_params(),
        variables,
        datatype_slots,
        branches: vec![kinds],
        row_plan: RowPlan::Columns,
        compensation: None,
    })
}

fn translate_aggregate(
    aggregate: &AggregateExpression,
    branch: &BranchBuilder<'_>,
    kind: &'static str,
) -> Result<String, Untranslatable> {
    match aggregate {
        AggregateExpression::CountSolutions { distinct: false } => Ok("count(*)".into()),
        AggregateExpression::CountSolutions { distinct: true } => Err(Untranslatable::new(
            kind,
            "COUNT(DISTINCT *) is not supported",
        )),
        AggregateExpression::FunctionCall {
            name,
            expr: Expression::Variable(variable),
            distinct,
        } => {
            let function = match name {
                AggregateFunction::Count => "count",
                AggregateFunction::Sum => "sum",
                AggregateFunction::Avg => "avg",
                AggregateFunction::Min => "min",
                AggregateFunction::Max => "max",
                name => {
                    return Err(Untranslatable::new(
                        kind,
                        format!("the {name} aggregate is not supported"),
                    ));
                }
            };
            let Some(binding) = branch.bindings.get(variable) else {
                return Err(Untranslatable::new(
                    kind,
                    format!("aggregated variable {variable} is not bound by the pattern"),
                ));
            };
            let operand = binding.cypher_ref();
            Ok(if *distinct {
                format!("{function}(DISTINCT {operand})")
            } else {
                format!("{function}({operand})")
            })
        }
        AggregateExpression::FunctionCall { .. } => Err(Untranslatable::new(
            kind,
            "only aggregates over a single variable are supported",
        )),
    }
}

/// Which way an ambiguous variable is fixed in a given branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AmbiguousChoice {
    EdgeTarget,
    PropertyValue,
}

type Assignment = FxHashMap<Variable, AmbiguousChoice>;

fn ambiguous_assignments(
    patterns: &[TriplePattern],
    analysis: &BgpAnalysis,
    require_relationship: bool,
    kind: &'static str,
) -> Result<Vec<Assignment>, Untranslatable> {
    let mut ambiguous: Vec<&Variable> = analysis.ambiguous_variables().collect();
    ambiguous.sort_unstable();
    if ambiguous.is_empty() {
        return Ok(vec![Assignment::default()]);
    }
    if patterns.len() > 1 {
        if ambiguous.len() > MAX_AMBIGUOUS_VARIABLES {
            return Err(Untranslatable::new(
                kind,
                format!(
                    "more than {MAX_AMBIGUOUS_VARIABLES} ambiguous variables in a multi-triple pattern"
                ),
            ));
        }
        let has_relationship = patterns.iter().any(|pattern| {
            match &pattern.object {
                TermPattern::Variable(v) => analysis.role(v) == Some(VariableRole::Node),
                TermPattern::NamedNode(_) | TermPattern::BlankNode(_) => {
                    !matches!(&pattern.predicate, NamedNodePattern::NamedNode(p) if p.as_ref() == rdf::TYPE)
                }
                TermPattern::Literal(_) => false,
            }
        });
        if require_relationship && !has_relationship {
            return Err(Untranslatable::new(
                kind,
                "ambiguous variables need at least one relationship in the pattern",
            ));
        }
    }
    let mut assignments = vec![Assignment::default()];
    for variable in ambiguous {
        let mut next = Vec::with_capacity(assignments.len() * 2);
        for assignment in assignments {
            let mut edge = assignment.clone();
            edge.insert(variable.clone(), AmbiguousChoice::EdgeTarget);
            next.push(edge);
            let mut property = assignment;
            property.insert(variable.clone(), AmbiguousChoice::PropertyValue);
            next.push(property);
        }
        assignments = next;
    }
    Ok(assignments)
}

/// Builds the clauses of one branch: `MATCH`es, the main `WHERE`,
/// label `UNWIND`s and their trailing conditions.
struct BranchBuilder<'a> {
    analysis: &'a BgpAnalysis,
    assignment: &'a Assignment,
    bindings: FxHashMap<Variable, VarBinding>,
    concrete_idents: FxHashMap<String, String>,
    declared: Vec<String>,
    next_ident: usize,
    match_clauses: Vec<String>,
    optional_clauses: Vec<String>,
    conditions: Vec<String>,
    unwinds: Vec<String>,
    post_conditions: Vec<String>,
}

impl<'a> BranchBuilder<'a> {
    fn new(analysis: &'a BgpAnalysis, assignment: &'a Assignment) -> Self {
        Self {
            analysis,
            assignment,
            bindings: FxHashMap::default(),
            concrete_idents: FxHashMap::default(),
            declared: Vec::new(),
            next_ident: 0,
            match_clauses: Vec::new(),
            optional_clauses: Vec::new(),
            conditions: Vec::new(),
            unwinds: Vec::new(),
            post_conditions: Vec::new(),
        }
    }

    fn fresh_ident(&mut self, prefix: &str) -> String {
        let ident = format!("{prefix}{}", self.next_ident);
        self.next_ident += 1;
        ident
    }

    /// The node pattern for a subject/object term: declares the
    /// identifier with its `Resource` label and `uri` constraint on
    /// first use, a bare reference afterwards.
    fn node_pattern(
        &mut self,
        term: &TermPattern,
        params: &mut ParamTable,
        kind: &'static str,
    ) -> Result<String, Untranslatable> {
        let (ident, uri) = match term {
            TermPattern::Variable(v) => {
                if let Some(binding) = self.bindings.get(v) {
                    let VarBinding::Node(ident) = binding else {
                        return Err(Untranslatable::new(
                            kind,
                            format!("variable {v} is used both as a resource and as a literal"),
                        ));
                    };
                    (ident.clone(), None)
                } else {
                    let ident = self.fresh_ident("v");
                    self.bindings.insert(v.clone(), VarBinding::Node(ident.clone()));
                    (ident, None)
                }
            }
            TermPattern::NamedNode(n) => {
                let uri = n.as_str().to_owned();
                match self.concrete_idents.get(&uri) {
                    Some(ident) => (ident.clone(), None),
                    None => {
                        let ident = self.fresh_ident("v");
                        self.concrete_idents.insert(uri.clone(), ident.clone());
                        (ident, Some(uri))
                    }
                }
            }
            TermPattern::BlankNode(b) => {
                let uri = format!("_:{}", b.as_str());
                match self.concrete_idents.get(&uri) {
                    Some(ident) => (ident.clone(), None),
                    None => {
                        let ident = self.fresh_ident("v");
                        self.concrete_idents.insert(uri.clone(), ident.clone());
                        (ident, Some(uri))
                    }
                }
            }
            TermPattern::Literal(_) => {
                return Err(Untranslatable::new(kind, "literal subjects cannot match"));
            }
        };
        Ok(if self.declared.contains(&ident) {
            format!("({ident})")
        } else {
            self.declared.push(ident.clone());
            match uri {
                Some(uri) => {
                    let param = params.add(CypherValue::String(uri));
                    format!("({ident}:`{RESOURCE_LABEL}` {{uri: {param}}})")
                }
                None => format!("({ident}:`{RESOURCE_LABEL}`)"),
            }
        })
    }

    fn add_patterns(
        &mut self,
        patterns: &[TriplePattern],
        params: &mut ParamTable,
        kind: &'static str,
    ) -> Result<(), Untranslatable> {
        for pattern in patterns {
            self.add_pattern(pattern, params, kind, false)?;
        }
        Ok(())
    }

    fn add_optional_patterns(
        &mut self,
        patterns: &[TriplePattern],
        params: &mut ParamTable,
    ) -> Result<(), Untranslatable> {
        for pattern in patterns {
            self.add_pattern(pattern, params, "OPTIONAL", true)?;
        }
        Ok(())
    }

    fn add_pattern(
        &mut self,
        pattern: &TriplePattern,
        params: &mut ParamTable,
        kind: &'static str,
        optional: bool,
    ) -> Result<(), Untranslatable> {
        let NamedNodePattern::NamedNode(predicate) = &pattern.predicate else {
            return Err(Untranslatable::new(kind, "unexpected variable predicate"));
        };
        if predicate.as_ref() == rdf::TYPE {
            return self.add_type_pattern(pattern, params, kind, optional);
        }
        if predicate.as_str().ends_with(DATATYPE_SUFFIX) {
            // Metadata keys are invisible to the read path.
            self.conditions.push("false".into());
            return Ok(());
        }
        match &pattern.object {
            TermPattern::Literal(literal) => {
                if optional {
                    return Err(Untranslatable::new(
                        kind,
                        "concrete literals in optional patterns are not supported",
                    ));
                }
                let subject = self.node_pattern(&pattern.subject, params, kind)?;
                self.match_clauses.push(format!("MATCH {subject}"));
                let ident = self.subject_ident(&pattern.subject)?;
                let key = escape_name(predicate.as_str());
                let (value, datatype) = encode_literal(literal.as_ref());
                let value_param = params.add(value);
                self.conditions.push(format!("{ident}.`{key}` = {value_param}"));
                match datatype {
                    Some(datatype) => {
                        let datatype_param = params.add(CypherValue::String(datatype));
                        self.conditions
                            .push(format!("{ident}.`{key}{DATATYPE_SUFFIX}` = {datatype_param}"));
                    }
                    None => self
                        .conditions
                        .push(format!("{ident}.`{key}{DATATYPE_SUFFIX}` IS NULL")),
                }
            }
            TermPattern::Variable(v) if self.is_property_object(v) => {
                let subject = self.node_pattern(&pattern.subject, params, kind)?;
                let ident = self.subject_ident(&pattern.subject)?;
                let key = predicate.as_str().to_owned();
                let reference = VarBinding::Property {
                    ident: ident.clone(),
                    key: key.clone(),
                };
                if let Some(existing) = self.bindings.get(v) {
                    // The variable is already bound elsewhere; join on
                    // value equality.
                    let condition =
                        format!("{} = {}", reference.cypher_ref(), existing.cypher_ref());
                    self.conditions.push(condition);
                    if optional {
                        return Err(Untranslatable::new(
                            kind,
                            "optional patterns cannot re-bind variables",
                        ));
                    }
                    self.match_clauses.push(format!("MATCH {subject}"));
                } else {
                    self.bindings.insert(v.clone(), reference.clone());
                    if optional {
                        self.optional_clauses.push(format!(
                            "OPTIONAL MATCH {subject} WHERE {} IS NOT NULL",
                            reference.cypher_ref()
                        ));
                    } else {
                        self.match_clauses.push(format!("MATCH {subject}"));
                        self.conditions
                            .push(format!("{} IS NOT NULL", reference.cypher_ref()));
                    }
                }
            }
            object => {
                // A relationship: the object is a resource (concrete,
                // a node variable or an ambiguous variable fixed to
                // the edge side of its branch).
                let subject = self.node_pattern(&pattern.subject, params, kind)?;
                let object = self.node_pattern(object, params, kind)?;
                let clause = format!(
                    "{} {subject}-[:`{}`]->{object}",
                    if optional { "OPTIONAL MATCH" } else { "MATCH" },
                    escape_name(predicate.as_str())
                );
                if optional {
                    self.optional_clauses.push(clause);
                } else {
                    self.match_clauses.push(clause);
                }
            }
        }
        Ok(())
    }

    fn add_type_pattern(
        &mut self,
        pattern: &TriplePattern,
        params: &mut ParamTable,
        kind: &'static str,
        optional: bool,
    ) -> Result<(), Untranslatable> {
        if optional {
            return Err(Untranslatable::new(
                kind,
                "rdf:type patterns are not supported in optional patterns",
            ));
        }
        match &pattern.object {
            TermPattern::NamedNode(class) => {
                let subject = self.node_pattern(&pattern.subject, params, kind)?;
                self.match_clauses.push(format!("MATCH {subject}"));
                let ident = self.subject_ident(&pattern.subject)?;
                self.match_clauses
                    .push(format!("MATCH ({ident}:`{}`)", escape_name(class.as_str())));
            }
            TermPattern::Variable(v) => {
                let subject = self.node_pattern(&pattern.subject, params, kind)?;
                self.match_clauses.push(format!("MATCH {subject}"));
                let ident = self.subject_ident(&pattern.subject)?;
                match self.bindings.get(v).cloned() {
                    None => {
                        let alias = self.fresh_ident("t");
                        self.unwinds
                            .push(format!("UNWIND labels({ident}) AS {alias}"));
                        self.post_conditions
                            .push(format!("{alias} <> '{RESOURCE_LABEL}'"));
                        self.bindings.insert(v.clone(), VarBinding::Label(alias));
                    }
                    Some(VarBinding::Node(node)) => {
                        // The class is itself a resource elsewhere in
                        // the pattern; join the label to its uri.
                        let alias = self.fresh_ident("t");
                        let node = node.clone();
                        self.unwinds
                            .push(format!("UNWIND labels({ident}) AS {alias}"));
                        self.post_conditions
                            .push(format!("{alias} <> '{RESOURCE_LABEL}'"));
                        self.post_conditions.push(format!("{alias} = {node}.uri"));
                    }
                    Some(_) => {
                        return Err(Untranslatable::new(
                            kind,
                            format!("variable {v} cannot be both a class and a literal"),
                        ));
                    }
                }
            }
            TermPattern::BlankNode(_) | TermPattern::Literal(_) => {
                // Only IRIs are encoded as labels.
                self.conditions.push("false".into());
            }
        }
        Ok(())
    }

    fn is_property_object(&self, variable: &Variable) -> bool {
        match self.assignment.get(variable) {
            Some(AmbiguousChoice::PropertyValue) => true,
            Some(AmbiguousChoice::EdgeTarget) => false,
            None => matches!(self.analysis.role(variable), Some(VariableRole::Ambiguous)),
        }
    }

    fn subject_ident(&self, term: &TermPattern) -> Result<String, Untranslatable> {
        match term {
            TermPattern::Variable(v) => match self.bindings.get(v) {
                Some(VarBinding::Node(ident)) => Ok(ident.clone()),
                _ => Err(Untranslatable::new("BGP", "missing subject binding")),
            },
            TermPattern::NamedNode(n) => self
                .concrete_idents
                .get(n.as_str())
                .cloned()
                .ok_or_else(|| Untranslatable::new("BGP", "missing subject binding")),
            TermPattern::BlankNode(b) => self
                .concrete_idents
                .get(&format!("_:{}", b.as_str()))
                .cloned()
                .ok_or_else(|| Untranslatable::new("BGP", "missing subject binding")),
            TermPattern::Literal(_) => {
                Err(Untranslatable::new("BGP", "literal subjects cannot match"))
            }
        }
    }

    fn add_filter(
        &mut self,
        expression: &Expression,
        params: &mut ParamTable,
    ) -> Result<(), Untranslatable> {
        let scope = ExprScope {
            bindings: &self.bindings,
        };
        let fragment = translate_expression(expression, &scope, params)?;
        if self.unwinds.is_empty() {
            self.conditions.push(fragment);
        } else {
            self.post_conditions.push(fragment);
        }
        Ok(())
    }

    /// All clauses up to (but excluding) `RETURN`.
    fn render_clauses(&self) -> String {
        let mut parts: Vec<String> = self.match_clauses.clone();
        if parts.is_empty() {
            parts.push(format!("MATCH (v:`{RESOURCE_LABEL}`)"));
        }
        if !self.conditions.is_empty() {
            parts.push(format!("WHERE {}", self.conditions.join(" AND ")));
        }
        parts.extend(self.optional_clauses.iter().cloned());
        parts.extend(self.unwinds.iter().cloned());
        if !self.post_conditions.is_empty() {
            parts.push(format!("WITH * WHERE {}", self.post_conditions.join(" AND ")));
        }
        parts.join(" ")
    }
}

fn required_variables(patterns: &[TriplePattern]) -> Vec<Variable> {
    let mut variables = Vec::new();
    for pattern in patterns {
        for term in [&pattern.subject, &pattern.object] {
            if let TermPattern::Variable(v) = term {
                if !variables.contains(v) {
                    variables.push(v.clone());
                }
            }
        }
        if let NamedNodePattern::Variable(v) = &pattern.predicate {
            if !variables.contains(v) {
                variables.push(v.clone());
            }
        }
    }
    variables
}

fn compensation_for(variables: &[Variable], required: &[Variable]) -> LeftJoinCompensation {
    let mut required_indices = Vec::new();
    let mut optional_indices = Vec::new();
    for (i, variable) in variables.iter().enumerate() {
        if required.contains(variable) {
            required_indices.push(i);
        } else {
            optional_indices.push(i);
        }
    }
    LeftJoinCompensation {
        required: required_indices,
        optional: optional_indices,
    }
}

/// Renders a set of branches into the final statement, aligning the
/// projected columns by variable name across branches.
fn render_branches(
    branches: Vec<BranchBuilder<'_>>,
    output_variables: &[Variable],
    params: ParamTable,
    kind: &'static str,
) -> Result<CompiledQuery, Untranslatable> {
    // The physical projection lists the output variables bound in at
    // least one branch, in the requested order.
    let variables: Vec<Variable> = output_variables
        .iter()
        .filter(|v| branches.iter().any(|b| b.bindings.contains_key(*v)))
        .cloned()
        .collect();
    if variables.is_empty() && !output_variables.is_empty() {
        return Err(Untranslatable::new(
            kind,
            "the pattern binds none of the output variables",
        ));
    }
    let datatype_slots: Vec<bool> = variables
        .iter()
        .map(|v| {
            branches.iter().any(|b| {
                matches!(b.bindings.get(v), Some(VarBinding::Property { .. }))
            })
        })
        .collect();
    let multi = branches.len() > 1;
    let mut statements = Vec::with_capacity(branches.len());
    let mut branch_kinds = Vec::with_capacity(branches.len());
    for (branch_index, branch) in branches.iter().enumerate() {
        let mut projections = Vec::new();
        if multi {
            projections.push(format!("{branch_index} AS b0"));
        }
        let mut kinds = Vec::with_capacity(variables.len());
        for (i, variable) in variables.iter().enumerate() {
            let column = format!("c{i}");
            match branch.bindings.get(variable) {
                Some(binding) => {
                    projections.push(format!("{} AS {column}", binding.cypher_ref()));
                    if datatype_slots[i] {
                        match binding {
                            VarBinding::Property { ident, key } => projections.push(format!(
                                "{ident}.`{}{DATATYPE_SUFFIX}` AS {column}_dt",
                                escape_name(key)
                            )),
                            _ => projections.push(format!("null AS {column}_dt")),
                        }
                    }
                    kinds.push(Some(binding.column_type()));
                }
                None => {
                    projections.push(format!("null AS {column}"));
                    if datatype_slots[i] {
                        projections.push(format!("null AS {column}_dt"));
                    }
                    kinds.push(None);
                }
            }
        }
        if projections.is_empty() {
            // Existence checks still need a valid projection.
            projections.push("1 AS one".into());
        }
        branch_kinds.push(kinds);
        statements.push(format!(
            "{} RETURN {}",
            branch.render_clauses(),
            projections.join(", ")
        ));
    }
    Ok(CompiledQuery {
        cypher: statements.join(" UNION ALL "),
        params: params.into_params(),
        variables,
        datatype_slots,
        branches: branch_kinds,
        row_plan: RowPlan::Columns,
        compensation: None,
    })
}

/// Compiles the three-way variable-predicate union over a single
/// triple: edges, properties (via whole-node keys enumeration) and
/// labels standing for `rdf:type`.
fn compile_var_predicate(
    pattern: &TriplePattern,
    filter: Option<&Expression>,
    output_variables: &[Variable],
    left: Option<(BranchBuilder<'_>, Vec<Variable>)>,
    optional: bool,
    mut params: ParamTable,
    kind: &'static str,
) -> Result<CompiledQuery, Untranslatable> {
    if filter.is_some() {
        return Err(Untranslatable::new(
            kind,
            "filters over variable-predicate patterns are not supported",
        ));
    }
    let NamedNodePattern::Variable(predicate_variable) = &pattern.predicate else {
        return Err(Untranslatable::new(kind, "expected a variable predicate"));
    };
    let (left_clauses, left_bindings, required) = match &left {
        Some((builder, required)) => (
            format!("{} ", builder.render_clauses()),
            builder.bindings.clone(),
            required.clone(),
        ),
        None => (String::new(), FxHashMap::default(), Vec::new()),
    };
    // The subject pattern: either a variable (possibly bound by the
    // required side) or a concrete resource.
    let (subject_intro, subject_ident, subject_variable) = match &pattern.subject {
        TermPattern::Variable(v) => match left_bindings.get(v) {
            Some(VarBinding::Node(ident)) => (format!("({ident})"), ident.clone(), Some(v.clone())),
            Some(_) => {
                return Err(Untranslatable::new(
                    kind,
                    format!("variable {v} is used both as a resource and as a literal"),
                ));
            }
            None => (
                format!("(s0:`{RESOURCE_LABEL}`)"),
                "s0".to_owned(),
                Some(v.clone()),
            ),
        },
        TermPattern::NamedNode(n) => {
            let param = params.add(CypherValue::String(n.as_str().to_owned()));
            (
                format!("(s0:`{RESOURCE_LABEL}` {{uri: {param}}})"),
                "s0".to_owned(),
                None,
            )
        }
        TermPattern::BlankNode(b) => {
            let param = params.add(CypherValue::String(format!("_:{}", b.as_str())));
            (
                format!("(s0:`{RESOURCE_LABEL}` {{uri: {param}}})"),
                "s0".to_owned(),
                None,
            )
        }
        TermPattern::Literal(_) => {
            return Err(Untranslatable::new(kind, "literal subjects cannot match"));
        }
    };

    // Object constraints select the branches.
    let mut object_variable = None;
    let mut object_literal = None;
    let mut edge_object = format!("(o0:`{RESOURCE_LABEL}`)");
    let mut label_condition = None;
    let mut with_edges = true;
    let mut with_properties = true;
    let mut with_labels = true;
    match &pattern.object {
        TermPattern::Variable(v) => {
            if left_bindings.contains_key(v) || Some(v) == subject_variable.as_ref() {
                return Err(Untranslatable::new(
                    kind,
                    "variable-predicate objects cannot be bound elsewhere",
                ));
            }
            object_variable = Some(v.clone());
        }
        TermPattern::NamedNode(n) => {
            let param = params.add(CypherValue::String(n.as_str().to_owned()));
            edge_object = format!("(o0:`{RESOURCE_LABEL}` {{uri: {param}}})");
            let label_param = params.add(CypherValue::String(n.as_str().to_owned()));
            label_condition = Some(label_param);
            with_properties = false;
        }
        TermPattern::BlankNode(b) => {
            let param = params.add(CypherValue::String(format!("_:{}", b.as_str())));
            edge_object = format!("(o0:`{RESOURCE_LABEL}` {{uri: {param}}})");
            with_properties = false;
            with_labels = false;
        }
        TermPattern::Literal(literal) => {
            object_literal = Some(literal.clone());
            with_edges = false;
            with_labels = false;
        }
    }
    if optional && (!with_edges || !with_properties || !with_labels) {
        return Err(Untranslatable::new(
            kind,
            "optional variable-predicate patterns need a variable object",
        ));
    }

    // variables = required vars present in output, then subject,
    // predicate and object variables.
    let mut variables: Vec<Variable> = Vec::new();
    let mut datatype_slots = Vec::new();
    let mut required_projection = Vec::new();
    for v in output_variables {
        if let Some(binding) = left_bindings.get(v) {
            required_projection.push((variables.len(), binding.clone()));
            datatype_slots.push(matches!(binding, VarBinding::Property { .. }));
            variables.push(v.clone());
        }
    }
    let subject_index = subject_variable.as_ref().map(|v| {
        if let Some(i) = variables.iter().position(|x| x == v) {
            i
        } else {
            datatype_slots.push(false);
            variables.push(v.clone());
            variables.len() - 1
        }
    });
    datatype_slots.push(false);
    variables.push(predicate_variable.clone());
    let predicate_index = variables.len() - 1;
    let object_index = object_variable.as_ref().map(|v| {
        datatype_slots.push(false);
        variables.push(v.clone());
        variables.len() - 1
    });

    let project_required = |projections: &mut Vec<String>| {
        for (i, binding) in &required_projection {
            projections.push(format!("{} AS c{i}", binding.cypher_ref()));
            if let VarBinding::Property { ident, key } = binding {
                projections.push(format!(
                    "{ident}.`{}{DATATYPE_SUFFIX}` AS c{i}_dt",
                    escape_name(key)
                ));
            }
        }
        if let Some(i) = subject_index {
            if required_projection.iter().all(|(j, _)| j != &i) {
                projections.push(format!("{subject_ident}.uri AS c{i}"));
            }
        }
    };

    let mut statements = Vec::new();
    let mut branch_kinds = Vec::new();
    if with_edges {
        let mut projections = vec![format!("{} AS b0", statements.len())];
        project_required(&mut projections);
        projections.push("type(r0) AS q0".to_owned());
        projections.push("o0.uri AS q1".to_owned());
        let match_kind = if optional { "OPTIONAL MATCH" } else { "MATCH" };
        statements.push(format!(
            "{left_clauses}MATCH {subject_intro} {match_kind} ({subject_ident})-[r0]->{edge_object} RETURN {}",
            projections.join(", ")
        ));
        branch_kinds.push(VarPredicateBranch::Edges);
    }
    if with_properties {
        let mut projections = vec![format!("{} AS b0", statements.len())];
        project_required(&mut projections);
        projections.push(format!("{subject_ident} AS q0"));
        projections.push("null AS q1".to_owned());
        statements.push(format!(
            "{left_clauses}MATCH {subject_intro} RETURN {}",
            projections.join(", ")
        ));
        branch_kinds.push(VarPredicateBranch::Properties);
    }
    if with_labels {
        let mut projections = vec![format!("{} AS b0", statements.len())];
        project_required(&mut projections);
        projections.push("t0 AS q0".to_owned());
        projections.push("null AS q1".to_owned());
        let condition = match &label_condition {
            Some(param) => format!("t0 <> '{RESOURCE_LABEL}' AND t0 = {param}"),
            None => format!("t0 <> '{RESOURCE_LABEL}'"),
        };
        statements.push(format!(
            "{left_clauses}MATCH {subject_intro} UNWIND labels({subject_ident}) AS t0 \
             WITH * WHERE {condition} RETURN {}",
            projections.join(", ")
        ));
        branch_kinds.push(VarPredicateBranch::Labels);
    }
    if statements.is_empty() {
        return Err(Untranslatable::new(kind, "the pattern can never match"));
    }

    let compensation = optional.then(|| {
        let mut required_vars = required;
        if let Some(v) = &subject_variable {
            if !required_vars.contains(v) {
                required_vars.push(v.clone());
            }
        }
        compensation_for(&variables, &required_vars)
    });
    // Column typing of everything before the q0/q1 payload columns.
    let mut prefix_kinds: Vec<Option<ColumnType>> = Vec::with_capacity(variables.len());
    for i in 0..variables.len() {
        if i == predicate_index || Some(i) == object_index {
            prefix_kinds.push(None);
        } else if let Some((_, binding)) = required_projection.iter().find(|(j, _)| *j == i) {
            prefix_kinds.push(Some(binding.column_type()));
        } else {
            prefix_kinds.push(Some(ColumnType::NodeUri));
        }
    }
    Ok(CompiledQuery {
        cypher: statements.join(" UNION ALL "),
        params: params.into_params(),
        variables,
        datatype_slots,
        branches: vec![prefix_kinds],
        row_plan: RowPlan::VarPredicate(VarPredicatePlan {
            subject: subject_index,
            predicate: predicate_index,
            object: object_index,
            object_literal,
            branch_kinds,
            optional,
        }),
        compensation,
    })
}
