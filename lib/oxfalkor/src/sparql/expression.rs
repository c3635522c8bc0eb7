//! Translation of SPARQL filter expressions into Cypher boolean
//! fragments.
//!
//! Only the subset that keeps SPARQL three-valued semantics on the
//! server is translated: comparisons, the logical connectives,
//! literals, bound variables and the GeoSPARQL function family.
//! Everything else reports untranslatable and the caller falls back.

use crate::sparql::geo::{self, GeoArg, geosparql_functions};
use crate::sparql::pattern::{ParamTable, Untranslatable, VarBinding};
use crate::storage::driver::CypherValue;
use oxrdf::vocab::{geosparql, xsd};
use oxrdf::{Literal, Variable};
use rustc_hash::FxHashMap;
use spargebra::algebra::{Expression, Function};

const KIND: &str = "FILTER";

/// The variable bindings of the surrounding compiled pattern.
pub(crate) struct ExprScope<'a> {
    pub(crate) bindings: &'a FxHashMap<Variable, VarBinding>,
}

/// Translates a filter expression into a Cypher boolean fragment,
/// adding its constants to the statement parameter table.
pub(crate) fn translate_expression(
    expression: &Expression,
    scope: &ExprScope<'_>,
    params: &mut ParamTable,
) -> Result<String, Untranslatable> {
    Ok(match expression {
        Expression::Or(a, b) => format!(
            "({} OR {})",
            translate_expression(a, scope, params)?,
            translate_expression(b, scope, params)?
        ),
        Expression::And(a, b) => format!(
            "({} AND {})",
            translate_expression(a, scope, params)?,
            translate_expression(b, scope, params)?
        ),
        Expression::Not(inner) => {
            format!("(NOT {})", translate_expression(inner, scope, params)?)
        }
        Expression::Equal(a, b) => translate_comparison("=", a, b, scope, params)?,
        Expression::Greater(a, b) => translate_comparison(">", a, b, scope, params)?,
        Expression::GreaterOrEqual(a, b) => translate_comparison(">=", a, b, scope, params)?,
        Expression::Less(a, b) => translate_comparison("<", a, b, scope, params)?,
        Expression::LessOrEqual(a, b) => translate_comparison("<=", a, b, scope, params)?,
        Expression::FunctionCall(Function::Custom(name), args)
            if name.as_ref() == geosparql_functions::SF_WITHIN
                || name.as_ref() == geosparql_functions::SF_CONTAINS
                || name.as_ref() == geosparql_functions::SF_INTERSECTS =>
        {
            translate_region_test(name.as_ref() == geosparql_functions::SF_CONTAINS, args, scope, params)?
        }
        expression => {
            return Err(Untranslatable::new(
                KIND,
                format!("unsupported filter expression {expression}"),
            ));
        }
    })
}

fn translate_comparison(
    operator: &str,
    a: &Expression,
    b: &Expression,
    scope: &ExprScope<'_>,
    params: &mut ParamTable,
) -> Result<String, Untranslatable> {
    Ok(format!(
        "{} {operator} {}",
        translate_operand(a, scope, params)?,
        translate_operand(b, scope, params)?
    ))
}

/// Translates a value-position operand: a variable reference, a
/// literal constant or a `geof:distance` call.
fn translate_operand(
    expression: &Expression,
    scope: &ExprScope<'_>,
    params: &mut ParamTable,
) -> Result<String, Untranslatable> {
    Ok(match expression {
        Expression::Variable(v) => match scope.bindings.get(v) {
            Some(binding) => binding.cypher_ref(),
            None => {
                return Err(Untranslatable::new(
                    KIND,
                    format!("variable {v} is not bound by the surrounding pattern"),
                ));
            }
        },
        Expression::Literal(literal) => translate_literal(literal, params)?,
        Expression::NamedNode(n) => params.add(CypherValue::String(n.as_str().to_owned())),
        Expression::FunctionCall(Function::Custom(name), args)
            if name.as_ref() == geosparql_functions::DISTANCE =>
        {
            let [a, b] = args.as_slice() else {
                return Err(Untranslatable::new(KIND, "geof:distance takes two arguments"));
            };
            format!(
                "distance({}, {})",
                translate_geometry_operand(a, scope, params)?,
                translate_geometry_operand(b, scope, params)?
            )
        }
        expression => {
            return Err(Untranslatable::new(
                KIND,
                format!("unsupported filter operand {expression}"),
            ));
        }
    })
}

fn translate_literal(
    literal: &Literal,
    params: &mut ParamTable,
) -> Result<String, Untranslatable> {
    if literal.language().is_some() {
        return Err(Untranslatable::new(
            KIND,
            "language-tagged literals cannot be compared server-side",
        ));
    }
    let datatype = literal.datatype();
    let value = literal.value();
    Ok(if datatype == xsd::STRING {
        params.add(CypherValue::String(value.into()))
    } else if datatype == xsd::BOOLEAN {
        match value.parse::<bool>() {
            Ok(b) => params.add(CypherValue::Boolean(b)),
            Err(_) => {
                return Err(Untranslatable::new(KIND, "malformed boolean literal"));
            }
        }
    } else if datatype == xsd::INTEGER
        || datatype == xsd::BYTE
        || datatype == xsd::SHORT
        || datatype == xsd::INT
        || datatype == xsd::LONG
    {
        match value.parse::<i64>() {
            Ok(i) => params.add(CypherValue::Integer(i)),
            Err(_) => {
                return Err(Untranslatable::new(KIND, "malformed integer literal"));
            }
        }
    } else if datatype == xsd::DOUBLE || datatype == xsd::FLOAT || datatype == xsd::DECIMAL {
        match value.parse::<f64>() {
            Ok(d) => params.add(CypherValue::Double(d)),
            Err(_) => {
                return Err(Untranslatable::new(KIND, "malformed numeric literal"));
            }
        }
    } else {
        return Err(Untranslatable::new(
            KIND,
            format!("literals of datatype {datatype} cannot be compared server-side"),
        ));
    })
}

/// A geometry-position operand: a variable holding a stored point or
/// a constant WKT literal.
fn translate_geometry_operand(
    expression: &Expression,
    scope: &ExprScope<'_>,
    params: &mut ParamTable,
) -> Result<String, Untranslatable> {
    match expression {
        Expression::Variable(v) => match scope.bindings.get(v) {
            Some(binding) => Ok(binding.cypher_ref()),
            None => Err(Untranslatable::new(
                KIND,
                format!("variable {v} is not bound by the surrounding pattern"),
            )),
        },
        Expression::Literal(literal) => {
            let arg = parse_wkt_argument(literal)?;
            Ok(point_fragment(&arg, params))
        }
        expression => Err(Untranslatable::new(
            KIND,
            format!("unsupported geometry operand {expression}"),
        )),
    }
}

fn parse_wkt_argument(literal: &Literal) -> Result<GeoArg, Untranslatable> {
    if literal.datatype() != geosparql::WKT_LITERAL {
        return Err(Untranslatable::new(
            KIND,
            format!(
                "geometry constants must be {} literals",
                geosparql::WKT_LITERAL
            ),
        ));
    }
    geo::parse_geometry(literal.value()).map_err(|e| Untranslatable::invalid_wkt(KIND, e))
}

fn point_fragment(arg: &GeoArg, params: &mut ParamTable) -> String {
    let (latitude, longitude) = arg.center();
    let latitude = params.add(CypherValue::Double(latitude));
    let longitude = params.add(CypherValue::Double(longitude));
    format!("point({{latitude: {latitude}, longitude: {longitude}}})")
}

/// `sfWithin` / `sfContains` / `sfIntersects`: a distance test
/// against the constant geometry's representative point, with the
/// circumscribed-circle radius as tolerance.
fn translate_region_test(
    region_first: bool,
    args: &[Expression],
    scope: &ExprScope<'_>,
    params: &mut ParamTable,
) -> Result<String, Untranslatable> {
    let [a, b] = args else {
        return Err(Untranslatable::new(
            KIND,
            "spatial relation functions take two arguments",
        ));
    };
    let (region, subject) = if region_first { (a, b) } else { (b, a) };
    let Expression::Literal(region) = region else {
        return Err(Untranslatable::new(
            KIND,
            "the region argument must be a constant geometry",
        ));
    };
    let region = parse_wkt_argument(region)?;
    let subject = translate_geometry_operand(subject, scope, params)?;
    let center = point_fragment(&region, params);
    let radius = params.add(CypherValue::Double(region.radius_meters()));
    Ok(format!("distance({subject}, {center}) <= {radius}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxrdf::NamedNode;

    fn scope_with(bindings: Vec<(Variable, VarBinding)>) -> FxHashMap<Variable, VarBinding> {
        bindings.into_iter().collect()
    }

    fn age_scope() -> FxHashMap<Variable, VarBinding> {
        scope_with(vec![(
            Variable::new_unchecked("age"),
            VarBinding::Property {
                ident: "v0".into(),
                key: "http://example.com/age".into(),
            },
        )])
    }

    #[test]
    fn numeric_range_filters_translate() -> Result<(), Untranslatable> {
        let bindings = age_scope();
        let scope = ExprScope {
            bindings: &bindings,
        };
        let mut params = ParamTable::default();
        let age = Expression::Variable(Variable::new_unchecked("age"));
        let expression = Expression::And(
            Box::new(Expression::GreaterOrEqual(
                Box::new(age.clone()),
                Box::new(Expression::Literal(Literal::from(18))),
            )),
            Box::new(Expression::Less(
                Box::new(age),
                Box::new(Expression::Literal(Literal::from(65))),
            )),
        );
        let fragment = translate_expression(&expression, &scope, &mut params)?;
        assert_eq!(
            fragment,
            "(v0.`http://example.com/age` >= $p0 AND v0.`http://example.com/age` < $p1)"
        );
        assert_eq!(
            params.into_params(),
            vec![
                ("p0".to_owned(), CypherValue::Integer(18)),
                ("p1".to_owned(), CypherValue::Integer(65)),
            ]
        );
        Ok(())
    }

    #[test]
    fn unsupported_operators_report_untranslatable() {
        let bindings = age_scope();
        let scope = ExprScope {
            bindings: &bindings,
        };
        let mut params = ParamTable::default();
        let expression = Expression::FunctionCall(
            Function::Str,
            vec![Expression::Variable(Variable::new_unchecked("age"))],
        );
        let error = translate_expression(&expression, &scope, &mut params).unwrap_err();
        assert!(error.reason.contains("unsupported filter expression"));
    }

    #[test]
    fn unbound_variables_report_untranslatable() {
        let bindings = scope_with(Vec::new());
        let scope = ExprScope {
            bindings: &bindings,
        };
        let mut params = ParamTable::default();
        let expression = Expression::Equal(
            Box::new(Expression::Variable(Variable::new_unchecked("x"))),
            Box::new(Expression::Literal(Literal::from(1))),
        );
        assert!(translate_expression(&expression, &scope, &mut params).is_err());
    }

    #[test]
    fn distance_comparison_translates_to_point_fragments() -> Result<(), Untranslatable> {
        let bindings = scope_with(vec![(
            Variable::new_unchecked("geom"),
            VarBinding::Property {
                ident: "v0".into(),
                key: "http://example.com/location".into(),
            },
        )]);
        let scope = ExprScope {
            bindings: &bindings,
        };
        let mut params = ParamTable::default();
        let distance = Expression::FunctionCall(
            Function::Custom(geosparql_functions::DISTANCE.into_owned()),
            vec![
                Expression::Variable(Variable::new_unchecked("geom")),
                Expression::Literal(Literal::new_typed_literal(
                    "POINT(2.3522 48.8566)",
                    geosparql::WKT_LITERAL,
                )),
            ],
        );
        let expression = Expression::Less(
            Box::new(distance),
            Box::new(Expression::Literal(Literal::from(10_000))),
        );
        let fragment = translate_expression(&expression, &scope, &mut params)?;
        assert_eq!(
            fragment,
            "distance(v0.`http://example.com/location`, \
             point({latitude: $p0, longitude: $p1})) < $p2"
        );
        Ok(())
    }

    #[test]
    fn region_tests_use_center_and_radius() -> Result<(), Untranslatable> {
        let bindings = scope_with(vec![(
            Variable::new_unchecked("geom"),
            VarBinding::Property {
                ident: "v0".into(),
                key: "http://example.com/location".into(),
            },
        )]);
        let scope = ExprScope {
            bindings: &bindings,
        };
        let mut params = ParamTable::default();
        let expression = Expression::FunctionCall(
            Function::Custom(geosparql_functions::SF_WITHIN.into_owned()),
            vec![
                Expression::Variable(Variable::new_unchecked("geom")),
                Expression::Literal(Literal::new_typed_literal(
                    "POLYGON((-1 48, 3 48, 3 52, -1 52, -1 48))",
                    geosparql::WKT_LITERAL,
                )),
            ],
        );
        let fragment = translate_expression(&expression, &scope, &mut params)?;
        assert!(fragment.starts_with("distance(v0.`http://example.com/location`, point("));
        assert!(fragment.ends_with("<= $p2"));
        let params = params.into_params();
        assert_eq!(params[0].1, CypherValue::Double(50.0));
        assert_eq!(params[1].1, CypherValue::Double(1.0));
        Ok(())
    }

    #[test]
    fn invalid_wkt_is_flagged_for_strict_mode() {
        let bindings = scope_with(Vec::new());
        let scope = ExprScope {
            bindings: &bindings,
        };
        let mut params = ParamTable::default();
        let expression = Expression::FunctionCall(
            Function::Custom(geosparql_functions::SF_WITHIN.into_owned()),
            vec![
                Expression::NamedNode(NamedNode::new_unchecked("http://example.com/x")),
                Expression::Literal(Literal::new_typed_literal(
                    "POINT OF NO RETURN",
                    geosparql::WKT_LITERAL,
                )),
            ],
        );
        let error = translate_expression(&expression, &scope, &mut params).unwrap_err();
        assert!(error.invalid_wkt.is_some());
    }
}
