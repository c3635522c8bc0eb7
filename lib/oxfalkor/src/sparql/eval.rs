//! The algebra executor: pushdown dispatch with transparent fallback.
//!
//! The executor walks the algebra tree of a query and, for the
//! recognized node kinds, compiles the whole tree into one Cypher
//! statement executed through the store facade. Any unrecognized node
//! or compilation failure reroutes the query to the [`spareval`]
//! evaluator over the triple-at-a-time dataset adapter; results are
//! identical, only slower.

use crate::metrics::StoreMetrics;
use crate::sparql::dataset::StoreDataset;
use crate::sparql::error::EvaluationError;
use crate::sparql::model::{QueryResults, QuerySolutionIter, QueryTripleIter};
use crate::sparql::pattern::{
    self, CompiledQuery, LeftJoinCompensation, RowPlan, Untranslatable, VarPredicateBranch,
};
use crate::sparql::QueryOptions;
use crate::storage::codec;
use crate::storage::driver::{CypherValue, Row};
use crate::storage::{Storage, StorageError};
use oxrdf::vocab::rdf;
use oxrdf::{BlankNode, NamedOrBlankNode, Term, Triple, Variable};
use rustc_hash::{FxHashMap, FxHashSet};
use spargebra::Query;
use spargebra::algebra::{Expression, GraphPattern, OrderExpression};
use spargebra::term::{NamedNodePattern, TermPattern, TriplePattern};
use spareval::QueryEvaluator;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

/// Evaluates a parsed query, trying pushdown first when enabled.
pub(crate) fn evaluate_query(
    storage: &Storage,
    metrics: &StoreMetrics,
    query: &Query,
    options: &QueryOptions,
    pushdown_enabled: bool,
    tracing_enabled: bool,
) -> Result<QueryResults, EvaluationError> {
    let executor = Executor { storage };
    if pushdown_enabled {
        let attempt = match query {
            Query::Select { pattern, .. } => executor
                .evaluate_pattern(pattern)
                .map(|solutions| QueryResults::Solutions(solutions.into_iter_solutions())),
            Query::Ask { pattern, .. } => executor
                .evaluate_pattern(pattern)
                .map(|solutions| QueryResults::Boolean(!solutions.rows.is_empty())),
            Query::Construct {
                template, pattern, ..
            } => executor.evaluate_pattern(pattern).map(|solutions| {
                QueryResults::Graph(instantiate_template(template, &solutions))
            }),
            Query::Describe { .. } => Err(PushdownError::Untranslatable(Untranslatable::new(
                "DESCRIBE",
                "concise descriptions are delegated to the host engine",
            ))),
        };
        match attempt {
            Ok(results) => {
                metrics.record_query(true);
                return Ok(results);
            }
            Err(PushdownError::Storage(error)) => return Err(error.into()),
            Err(PushdownError::Untranslatable(signal)) => {
                if options.strict_geospatial {
                    if let Some(error) = signal.invalid_wkt {
                        return Err(EvaluationError::InvalidWkt(error));
                    }
                }
                warn!(
                    target: "oxfalkor",
                    "{} pushdown optimization not applicable, using fallback implementation: {}",
                    signal.kind, signal.reason
                );
                if tracing_enabled {
                    debug!(
                        target: "oxfalkor",
                        falkordb_fallback = true,
                        kind = signal.kind,
                        "query rerouted to the fallback evaluator"
                    );
                }
            }
        }
    }
    metrics.record_query(false);
    let results = QueryEvaluator::new()
        .execute(StoreDataset::new(storage), query)
        .map_err(EvaluationError::from)?;
    Ok(results.into())
}

enum PushdownError {
    Untranslatable(Untranslatable),
    Storage(StorageError),
}

impl From<Untranslatable> for PushdownError {
    fn from(error: Untranslatable) -> Self {
        Self::Untranslatable(error)
    }
}

impl From<StorageError> for PushdownError {
    fn from(error: StorageError) -> Self {
        Self::Storage(error)
    }
}

/// Materialized solutions, rows aligned with the variable list.
struct Solutions {
    variables: Vec<Variable>,
    rows: Vec<Vec<Option<Term>>>,
}

impl Solutions {
    fn into_iter_solutions(self) -> QuerySolutionIter {
        let variables: Arc<[Variable]> = self.variables.into();
        QuerySolutionIter::new(variables, self.rows.into_iter().map(Ok))
    }
}

struct Executor<'a> {
    storage: &'a Storage,
}

impl Executor<'_> {
    fn evaluate_pattern(&self, pattern: &GraphPattern) -> Result<Solutions, PushdownError> {
        match pattern {
            GraphPattern::Bgp { patterns } => {
                if patterns.is_empty() {
                    return Ok(Solutions {
                        variables: Vec::new(),
                        rows: vec![Vec::new()],
                    });
                }
                let variables = pattern_variables(patterns);
                self.run(pattern::compile_bgp(patterns, &variables)?)
            }
            GraphPattern::Filter { expr, inner } => match inner.as_ref() {
                GraphPattern::Bgp { patterns } if !patterns.is_empty() => {
                    let variables = pattern_variables(patterns);
                    self.run(pattern::compile_bgp_with_filter(
                        patterns,
                        Some(expr),
                        &variables,
                    )?)
                }
                inner => Err(Untranslatable::new(
                    "FILTER",
                    format!(
                        "filters over {} nodes are not supported",
                        pattern_kind(inner)
                    ),
                )
                .into()),
            },
            GraphPattern::LeftJoin {
                left,
                right,
                expression,
            } => {
                let (GraphPattern::Bgp { patterns: required }, GraphPattern::Bgp { patterns: optional }) =
                    (left.as_ref(), right.as_ref())
                else {
                    return Err(Untranslatable::new(
                        "OPTIONAL",
                        "only left joins of basic graph patterns are supported",
                    )
                    .into());
                };
                let mut variables = pattern_variables(required);
                for variable in pattern_variables(optional) {
                    if !variables.contains(&variable) {
                        variables.push(variable);
                    }
                }
                self.run(pattern::compile_left_join(
                    required,
                    optional,
                    expression.as_ref(),
                    &variables,
                )?)
            }
            GraphPattern::Union { .. } => {
                let mut branches = Vec::new();
                collect_union_branches(pattern, &mut branches)?;
                let mut variables = Vec::new();
                for (patterns, _) in &branches {
                    for variable in pattern_variables(patterns) {
                        if !variables.contains(&variable) {
                            variables.push(variable);
                        }
                    }
                }
                self.run(pattern::compile_union(&branches, &variables)?)
            }
            GraphPattern::Group {
                inner,
                variables,
                aggregates,
            } => {
                let (patterns, filter) = match inner.as_ref() {
                    GraphPattern::Bgp { patterns } => (patterns, None),
                    GraphPattern::Filter { expr, inner } => match inner.as_ref() {
                        GraphPattern::Bgp { patterns } => (patterns, Some(expr)),
                        inner => {
                            return Err(Untranslatable::new(
                                "GROUP",
                                format!(
                                    "aggregation over {} nodes is not supported",
                                    pattern_kind(inner)
                                ),
                            )
                            .into());
                        }
                    },
                    inner => {
                        return Err(Untranslatable::new(
                            "GROUP",
                            format!(
                                "aggregation over {} nodes is not supported",
                                pattern_kind(inner)
                            ),
                        )
                        .into());
                    }
                };
                self.run(pattern::compile_group(
                    patterns, filter, variables, aggregates,
                )?)
            }
            GraphPattern::Project { inner, variables } => {
                let solutions = self.evaluate_pattern(inner)?;
                Ok(project(solutions, variables))
            }
            // The parser introduces internal variables for aggregate
            // results and renames them through Extend; only that
            // rename form is handled here.
            GraphPattern::Extend {
                inner,
                variable,
                expression: Expression::Variable(source),
            } => {
                let mut solutions = self.evaluate_pattern(inner)?;
                let index = solutions.variables.iter().position(|v| v == source);
                for row in &mut solutions.rows {
                    row.push(index.and_then(|i| row[i].clone()));
                }
                solutions.variables.push(variable.clone());
                Ok(solutions)
            }
            GraphPattern::Distinct { inner } | GraphPattern::Reduced { inner } => {
                let mut solutions = self.evaluate_pattern(inner)?;
                let mut seen = FxHashSet::default();
                solutions.rows.retain(|row| seen.insert(row.clone()));
                Ok(solutions)
            }
            GraphPattern::Slice {
                inner,
                start,
                length,
            } => {
                let mut solutions = self.evaluate_pattern(inner)?;
                let rows = solutions.rows.split_off((*start).min(solutions.rows.len()));
                solutions.rows = match length {
                    Some(length) => rows.into_iter().take(*length).collect(),
                    None => rows,
                };
                Ok(solutions)
            }
            GraphPattern::OrderBy { inner, expression } => {
                let mut solutions = self.evaluate_pattern(inner)?;
                let mut keys = Vec::with_capacity(expression.len());
                for order in expression {
                    let (variable, descending) = match order {
                        OrderExpression::Asc(Expression::Variable(v)) => (v, false),
                        OrderExpression::Desc(Expression::Variable(v)) => (v, true),
                        _ => {
                            return Err(Untranslatable::new(
                                "ORDER BY",
                                "only plain variable orderings are supported",
                            )
                            .into());
                        }
                    };
                    let Some(index) =
                        solutions.variables.iter().position(|x| x == variable)
                    else {
                        continue;
                    };
                    keys.push((index, descending));
                }
                solutions.rows.sort_by(|a, b| {
                    for (index, descending) in &keys {
                        let ordering = term_cmp(&a[*index], &b[*index]);
                        let ordering = if *descending {
                            ordering.reverse()
                        } else {
                            ordering
                        };
                        if ordering != Ordering::Equal {
                            return ordering;
                        }
                    }
                    Ordering::Equal
                });
                Ok(solutions)
            }
            pattern => Err(Untranslatable::new(
                pattern_kind(pattern),
                format!("the {} algebra node is not supported", pattern_kind(pattern)),
            )
            .into()),
        }
    }

    fn run(&self, compiled: CompiledQuery) -> Result<Solutions, PushdownError> {
        debug!(target: "oxfalkor", cypher = %compiled.cypher, "executing compiled statement");
        let raw_rows = self.storage.query(&compiled.cypher, &compiled.params)?;
        let mut rows = Vec::with_capacity(raw_rows.len());
        let branch_count = match &compiled.row_plan {
            RowPlan::Columns => {
                let offset = usize::from(compiled.has_discriminator());
                for row in &raw_rows {
                    let branch = if offset == 1 { discriminator(row)? } else { 0 };
                    let kinds = compiled.branches.get(branch).ok_or_else(|| {
                        StorageError::protocol(format!("unknown result branch {branch}"))
                    })?;
                    rows.push(codec::decode_row(
                        row.values(),
                        &compiled.datatype_slots,
                        kinds,
                        offset,
                    )?);
                }
                compiled.branches.len()
            }
            RowPlan::VarPredicate(plan) => {
                let kinds = compiled.branches.first().ok_or_else(|| {
                    StorageError::protocol("missing column typing for the compiled statement")
                })?;
                let payload_at = 1 + compiled
                    .datatype_slots
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != plan.predicate && Some(*i) != plan.object)
                    .map(|(_, dt)| 1 + usize::from(*dt))
                    .sum::<usize>();
                for row in &raw_rows {
                    let branch = discriminator(row)?;
                    let Some(branch_kind) = plan.branch_kinds.get(branch) else {
                        return Err(StorageError::protocol(format!(
                            "unknown result branch {branch}"
                        ))
                        .into());
                    };
                    let base = codec::decode_row(
                        row.values(),
                        &compiled.datatype_slots,
                        kinds,
                        1,
                    )?;
                    let q0 = row.values().get(payload_at).ok_or_else(|| {
                        StorageError::protocol("result row is shorter than the compiled projection")
                    })?;
                    let q1 = row.values().get(payload_at + 1);
                    expand_var_predicate_row(plan, *branch_kind, base, q0, q1, &mut rows)?;
                }
                plan.branch_kinds.len()
            }
        };
        if let Some(compensation) = &compiled.compensation {
            let divisor = match &compiled.row_plan {
                // Only the edges branch produces unbound rows.
                RowPlan::VarPredicate(_) => 1,
                RowPlan::Columns => branch_count,
            };
            rows = compensate(rows, compensation, divisor);
        }
        Ok(Solutions {
            variables: compiled.variables,
            rows,
        })
    }
}

/// Expands one result row of the variable-predicate union into
/// solutions: one per edge, one per data property, one per label.
fn expand_var_predicate_row(
    plan: &pattern::VarPredicatePlan,
    branch: VarPredicateBranch,
    base: Vec<Option<Term>>,
    q0: &CypherValue,
    q1: Option<&CypherValue>,
    rows: &mut Vec<Vec<Option<Term>>>,
) -> Result<(), StorageError> {
    match branch {
        VarPredicateBranch::Edges => {
            let mut row = base;
            match q0 {
                CypherValue::Null => {
                    if !plan.optional {
                        return Ok(());
                    }
                }
                CypherValue::String(name) => {
                    row[plan.predicate] = Some(
                        oxrdf::NamedNode::new(name.as_str())
                            .map_err(|e| {
                                StorageError::protocol(format!(
                                    "invalid relationship type {name:?}: {e}"
                                ))
                            })?
                            .into(),
                    );
                    if let Some(object) = plan.object {
                        let target = q1.and_then(|v| v.as_str()).ok_or_else(|| {
                            StorageError::protocol("missing edge target column")
                        })?;
                        row[object] = Some(codec::decode_resource_term(target)?);
                    }
                }
                value => {
                    return Err(StorageError::protocol(format!(
                        "expected a relationship type, got {value:?}"
                    )));
                }
            }
            rows.push(row);
        }
        VarPredicateBranch::Properties => {
            let CypherValue::Node(node) = q0 else {
                return Err(StorageError::protocol("expected a node projection"));
            };
            for (predicate, literal) in codec::node_property_pairs(node)? {
                if let Some(expected) = &plan.object_literal {
                    if &literal != expected {
                        continue;
                    }
                }
                let mut row = base.clone();
                row[plan.predicate] = Some(predicate.into());
                if let Some(object) = plan.object {
                    row[object] = Some(literal.into());
                }
                rows.push(row);
            }
        }
        VarPredicateBranch::Labels => {
            let label = q0.as_str().ok_or_else(|| {
                StorageError::protocol(format!("expected a label, got {q0:?}"))
            })?;
            let mut row = base;
            row[plan.predicate] = Some(rdf::TYPE.into_owned().into());
            if let Some(object) = plan.object {
                row[object] = Some(
                    oxrdf::NamedNode::new(label)
                        .map_err(|e| {
                            StorageError::protocol(format!("invalid type label {label:?}: {e}"))
                        })?
                        .into(),
                );
            }
            rows.push(row);
        }
    }
    Ok(())
}

fn discriminator(row: &Row) -> Result<usize, StorageError> {
    match row.values().first() {
        Some(CypherValue::Integer(i)) => usize::try_from(*i)
            .map_err(|_| StorageError::protocol("negative branch discriminator")),
        _ => Err(StorageError::protocol("missing branch discriminator")),
    }
}

/// Left-join compensation over the decoded rows: within each group of
/// identical required bindings, unbound rows survive only when the
/// group has no bound row, and their duplicates across branches are
/// collapsed back to the real multiplicity.
fn compensate(
    rows: Vec<Vec<Option<Term>>>,
    compensation: &LeftJoinCompensation,
    unbound_copies: usize,
) -> Vec<Vec<Option<Term>>> {
    let key_of = |row: &Vec<Option<Term>>| -> Vec<Option<Term>> {
        compensation
            .required
            .iter()
            .map(|i| row[*i].clone())
            .collect()
    };
    let is_bound = |row: &Vec<Option<Term>>| {
        compensation.optional.iter().any(|i| row[*i].is_some())
    };
    let mut bound_groups: FxHashSet<Vec<Option<Term>>> = FxHashSet::default();
    let mut unbound_total: FxHashMap<Vec<Option<Term>>, usize> = FxHashMap::default();
    for row in &rows {
        if is_bound(row) {
            bound_groups.insert(key_of(row));
        } else {
            *unbound_total.entry(key_of(row)).or_insert(0) += 1;
        }
    }
    let mut unbound_emitted: FxHashMap<Vec<Option<Term>>, usize> = FxHashMap::default();
    rows.into_iter()
        .filter(|row| {
            if is_bound(row) {
                return true;
            }
            let key = key_of(row);
            if bound_groups.contains(&key) {
                return false;
            }
            let target = unbound_total[&key].div_ceil(unbound_copies.max(1));
            let emitted = unbound_emitted.entry(key).or_insert(0);
            if *emitted < target {
                *emitted += 1;
                true
            } else {
                false
            }
        })
        .collect()
}

fn project(solutions: Solutions, variables: &[Variable]) -> Solutions {
    let indexes: Vec<Option<usize>> = variables
        .iter()
        .map(|v| solutions.variables.iter().position(|x| x == v))
        .collect();
    let rows = solutions
        .rows
        .into_iter()
        .map(|row| {
            indexes
                .iter()
                .map(|index| index.and_then(|i| row[i].clone()))
                .collect()
        })
        .collect();
    Solutions {
        variables: variables.to_vec(),
        rows,
    }
}

/// The SPARQL ordering over optional terms: unbound, then blank
/// nodes, then IRIs, then literals (numeric when both sides are).
fn term_cmp(a: &Option<Term>, b: &Option<Term>) -> Ordering {
    fn rank(term: &Option<Term>) -> u8 {
        match term {
            None => 0,
            Some(Term::BlankNode(_)) => 1,
            Some(Term::NamedNode(_)) => 2,
            Some(Term::Literal(_)) => 3,
        }
    }
    match (a, b) {
        (Some(Term::BlankNode(a)), Some(Term::BlankNode(b))) => a.as_str().cmp(b.as_str()),
        (Some(Term::NamedNode(a)), Some(Term::NamedNode(b))) => a.as_str().cmp(b.as_str()),
        (Some(Term::Literal(a)), Some(Term::Literal(b))) => {
            let numeric = a
                .value()
                .parse::<f64>()
                .ok()
                .zip(b.value().parse::<f64>().ok());
            match numeric {
                Some((a, b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
                None => a.value().cmp(b.value()),
            }
        }
        (a, b) => rank(a).cmp(&rank(b)),
    }
}

fn pattern_variables(patterns: &[TriplePattern]) -> Vec<Variable> {
    let mut variables = Vec::new();
    for pattern in patterns {
        if let TermPattern::Variable(v) = &pattern.subject {
            if !variables.contains(v) {
                variables.push(v.clone());
            }
        }
        if let NamedNodePattern::Variable(v) = &pattern.predicate {
            if !variables.contains(v) {
                variables.push(v.clone());
            }
        }
        if let TermPattern::Variable(v) = &pattern.object {
            if !variables.contains(v) {
                variables.push(v.clone());
            }
        }
    }
    variables
}

type UnionBranch = (Vec<TriplePattern>, Option<Expression>);

fn collect_union_branches(
    pattern: &GraphPattern,
    branches: &mut Vec<UnionBranch>,
) -> Result<(), Untranslatable> {
    match pattern {
        GraphPattern::Union { left, right } => {
            collect_union_branches(left, branches)?;
            collect_union_branches(right, branches)
        }
        GraphPattern::Bgp { patterns } => {
            branches.push((patterns.clone(), None));
            Ok(())
        }
        GraphPattern::Filter { expr, inner } => {
            if let GraphPattern::Bgp { patterns } = inner.as_ref() {
                branches.push((patterns.clone(), Some(expr.clone())));
                Ok(())
            } else {
                Err(Untranslatable::new(
                    "UNION",
                    "union branches must be basic graph patterns",
                ))
            }
        }
        pattern => Err(Untranslatable::new(
            "UNION",
            format!(
                "union branches must be basic graph patterns, found {}",
                pattern_kind(pattern)
            ),
        )),
    }
}

fn pattern_kind(pattern: &GraphPattern) -> &'static str {
    match pattern {
        GraphPattern::Bgp { .. } => "BGP",
        GraphPattern::Path { .. } => "PATH",
        GraphPattern::Join { .. } => "JOIN",
        GraphPattern::LeftJoin { .. } => "OPTIONAL",
        GraphPattern::Filter { .. } => "FILTER",
        GraphPattern::Union { .. } => "UNION",
        GraphPattern::Graph { .. } => "GRAPH",
        GraphPattern::Extend { .. } => "BIND",
        GraphPattern::Minus { .. } => "MINUS",
        GraphPattern::Values { .. } => "VALUES",
        GraphPattern::OrderBy { .. } => "ORDER BY",
        GraphPattern::Project { .. } => "PROJECT",
        GraphPattern::Distinct { .. } => "DISTINCT",
        GraphPattern::Reduced { .. } => "REDUCED",
        GraphPattern::Slice { .. } => "SLICE",
        GraphPattern::Group { .. } => "GROUP",
        GraphPattern::Service { .. } => "SERVICE",
        _ => "PATTERN",
    }
}

/// Instantiates a `CONSTRUCT` template over the solution rows, with
/// fresh blank nodes per solution and set semantics over the output.
fn instantiate_template(template: &[TriplePattern], solutions: &Solutions) -> QueryTripleIter {
    let mut triples = Vec::new();
    let mut seen = FxHashSet::default();
    for row in &solutions.rows {
        let mut blank_nodes: FxHashMap<String, BlankNode> = FxHashMap::default();
        for pattern in template {
            let Some(subject) = instantiate_subject(&pattern.subject, solutions, row, &mut blank_nodes)
            else {
                continue;
            };
            let predicate = match &pattern.predicate {
                NamedNodePattern::NamedNode(n) => n.clone(),
                NamedNodePattern::Variable(v) => {
                    match lookup(solutions, row, v) {
                        Some(Term::NamedNode(n)) => n,
                        _ => continue,
                    }
                }
            };
            let Some(object) =
                instantiate_object(&pattern.object, solutions, row, &mut blank_nodes)
            else {
                continue;
            };
            let triple = Triple::new(subject, predicate, object);
            if seen.insert(triple.clone()) {
                triples.push(Ok(triple));
            }
        }
    }
    QueryTripleIter {
        iter: Box::new(triples.into_iter()),
    }
}

fn lookup(solutions: &Solutions, row: &[Option<Term>], variable: &Variable) -> Option<Term> {
    let index = solutions.variables.iter().position(|v| v == variable)?;
    row.get(index)?.clone()
}

fn instantiate_subject(
    pattern: &TermPattern,
    solutions: &Solutions,
    row: &[Option<Term>],
    blank_nodes: &mut FxHashMap<String, BlankNode>,
) -> Option<NamedOrBlankNode> {
    match pattern {
        TermPattern::NamedNode(n) => Some(n.clone().into()),
        TermPattern::BlankNode(b) => Some(
            blank_nodes
                .entry(b.as_str().to_owned())
                .or_default()
                .clone()
                .into(),
        ),
        TermPattern::Variable(v) => match lookup(solutions, row, v)? {
            Term::NamedNode(n) => Some(n.into()),
            Term::BlankNode(b) => Some(b.into()),
            Term::Literal(_) => None,
        },
        TermPattern::Literal(_) => None,
    }
}

fn instantiate_object(
    pattern: &TermPattern,
    solutions: &Solutions,
    row: &[Option<Term>],
    blank_nodes: &mut FxHashMap<String, BlankNode>,
) -> Option<Term> {
    match pattern {
        TermPattern::NamedNode(n) => Some(n.clone().into()),
        TermPattern::BlankNode(b) => Some(
            blank_nodes
                .entry(b.as_str().to_owned())
                .or_default()
                .clone()
                .into(),
        ),
        TermPattern::Literal(l) => Some(l.clone().into()),
        TermPattern::Variable(v) => lookup(solutions, row, v),
    }
}
