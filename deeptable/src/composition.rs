//! Boolean expressions over named selections.
//!
//! A composition is written as JSON, either a selection name or an array whose first element
//! is an operator: `["AND", "a", ["NOT", "b"]]`. `NOT` takes one operand, `AND`, `OR` and `XOR`
//! take two, and `ANY`, `ALL` and `NONE` take one or more.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use arrow_array::cast::AsArray;
use deeptable_error::{DeeptableError, DeeptableResult, deeptable_bail, deeptable_err};
use deeptable_mask::Bitmask;
use futures::FutureExt;
use futures::future::{BoxFuture, try_join, try_join_all};
use serde_json::Value;

use crate::Tile;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Composition {
    /// The boolean column of another selection.
    Leaf(Arc<str>),
    Not(Box<Composition>),
    And(Box<Composition>, Box<Composition>),
    Or(Box<Composition>, Box<Composition>),
    Xor(Box<Composition>, Box<Composition>),
    /// True where any operand is true.
    AnyOf(Vec<Composition>),
    /// True where every operand is true.
    AllOf(Vec<Composition>),
    /// True where no operand is true.
    NoneOf(Vec<Composition>),
}

impl Composition {
    pub fn leaf(name: impl Into<Arc<str>>) -> Self {
        Composition::Leaf(name.into())
    }

    /// Parse the JSON form of a composition.
    pub fn from_json(value: &Value) -> DeeptableResult<Self> {
        match value {
            Value::String(name) => {
                if name.is_empty() {
                    deeptable_bail!(CompositionParse: "selection names must not be empty");
                }
                Ok(Composition::leaf(name.as_str()))
            }
            Value::Array(items) => {
                let Some((op, operands)) = items.split_first() else {
                    deeptable_bail!(CompositionParse: "empty composition");
                };
                let Some(op) = op.as_str() else {
                    deeptable_bail!(CompositionParse: "operator must be a string, found {}", op);
                };
                let mut operands = operands
                    .iter()
                    .map(Composition::from_json)
                    .collect::<DeeptableResult<Vec<_>>>()?;
                let arity_error = |expected: &str| {
                    deeptable_err!(
                        CompositionParse: "{} takes {} operands, found {}",
                        op,
                        expected,
                        operands.len()
                    )
                };
                match op.to_ascii_uppercase().as_str() {
                    "NOT" => {
                        if operands.len() != 1 {
                            return Err(arity_error("1"));
                        }
                        let operand = operands.remove(0);
                        Ok(Composition::Not(Box::new(operand)))
                    }
                    binary @ ("AND" | "OR" | "XOR") => {
                        if operands.len() != 2 {
                            return Err(arity_error("2"));
                        }
                        let rhs = Box::new(operands.remove(1));
                        let lhs = Box::new(operands.remove(0));
                        Ok(match binary {
                            "AND" => Composition::And(lhs, rhs),
                            "OR" => Composition::Or(lhs, rhs),
                            _ => Composition::Xor(lhs, rhs),
                        })
                    }
                    "ANY" | "ALL" | "NONE" if operands.is_empty() => Err(arity_error("at least 1")),
                    "ANY" => Ok(Composition::AnyOf(operands)),
                    "ALL" => Ok(Composition::AllOf(operands)),
                    "NONE" => Ok(Composition::NoneOf(operands)),
                    _ => deeptable_bail!(CompositionParse: "unknown operator {}", op),
                }
            }
            other => deeptable_bail!(
                CompositionParse: "expected a selection name or an operator array, found {}",
                other
            ),
        }
    }

    pub fn to_json(&self) -> Value {
        let nary = |op: &str, operands: &[Composition]| {
            Value::Array(
                std::iter::once(Value::from(op))
                    .chain(operands.iter().map(Composition::to_json))
                    .collect(),
            )
        };
        let binary = |op: &str, lhs: &Composition, rhs: &Composition| {
            Value::Array(vec![Value::from(op), lhs.to_json(), rhs.to_json()])
        };
        match self {
            Composition::Leaf(name) => Value::from(name.as_ref()),
            Composition::Not(operand) => Value::Array(vec![Value::from("NOT"), operand.to_json()]),
            Composition::And(lhs, rhs) => binary("AND", lhs, rhs),
            Composition::Or(lhs, rhs) => binary("OR", lhs, rhs),
            Composition::Xor(lhs, rhs) => binary("XOR", lhs, rhs),
            Composition::AnyOf(operands) => nary("ANY", operands),
            Composition::AllOf(operands) => nary("ALL", operands),
            Composition::NoneOf(operands) => nary("NONE", operands),
        }
    }

    /// The names of every selection the expression refers to, in order of appearance.
    pub fn leaves(&self) -> Vec<Arc<str>> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves(&self, out: &mut Vec<Arc<str>>) {
        match self {
            Composition::Leaf(name) => out.push(name.clone()),
            Composition::Not(operand) => operand.collect_leaves(out),
            Composition::And(lhs, rhs) | Composition::Or(lhs, rhs) | Composition::Xor(lhs, rhs) => {
                lhs.collect_leaves(out);
                rhs.collect_leaves(out);
            }
            Composition::AnyOf(operands)
            | Composition::AllOf(operands)
            | Composition::NoneOf(operands) => {
                for operand in operands {
                    operand.collect_leaves(out);
                }
            }
        }
    }

    /// Evaluate the expression on one tile. Leaves are resolved through
    /// [`Tile::get_column`], so referenced selections are materialized as needed.
    pub fn evaluate(&self, tile: Arc<Tile>) -> BoxFuture<'static, DeeptableResult<Bitmask>> {
        let this = self.clone();
        async move {
            Ok(match this {
                Composition::Leaf(name) => {
                    let column = tile.get_column(&name).await?;
                    let Some(bools) = column.as_boolean_opt() else {
                        deeptable_bail!(
                            "column {} is of type {} and cannot be used as a selection",
                            name,
                            column.data_type()
                        );
                    };
                    Bitmask::from_boolean_array(bools)
                }
                Composition::Not(operand) => operand.evaluate(tile).await?.not(),
                Composition::And(lhs, rhs) => {
                    let (lhs, rhs) = try_join(lhs.evaluate(tile.clone()), rhs.evaluate(tile)).await?;
                    lhs.and(&rhs)
                }
                Composition::Or(lhs, rhs) => {
                    let (lhs, rhs) = try_join(lhs.evaluate(tile.clone()), rhs.evaluate(tile)).await?;
                    lhs.or(&rhs)
                }
                Composition::Xor(lhs, rhs) => {
                    let (lhs, rhs) = try_join(lhs.evaluate(tile.clone()), rhs.evaluate(tile)).await?;
                    lhs.xor(&rhs)
                }
                Composition::AnyOf(operands) => Bitmask::any(&evaluate_all(&operands, &tile).await?),
                Composition::AllOf(operands) => Bitmask::all(&evaluate_all(&operands, &tile).await?),
                Composition::NoneOf(operands) => {
                    Bitmask::none(&evaluate_all(&operands, &tile).await?)
                }
            })
        }
        .boxed()
    }
}

async fn evaluate_all(operands: &[Composition], tile: &Arc<Tile>) -> DeeptableResult<Vec<Bitmask>> {
    try_join_all(operands.iter().map(|operand| operand.evaluate(tile.clone()))).await
}

impl TryFrom<&Value> for Composition {
    type Error = DeeptableError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        Composition::from_json(value)
    }
}

impl FromStr for Composition {
    type Err = DeeptableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: Value = serde_json::from_str(s)
            .map_err(|e| deeptable_err!(CompositionParse: "invalid JSON: {}", e))?;
        Composition::from_json(&value)
    }
}

impl Display for Composition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_nested_expressions() {
        let composition: Composition = r#"["AND", "sel1", ["NOT", "sel2"]]"#.parse().unwrap();
        assert_eq!(
            composition,
            Composition::And(
                Box::new(Composition::leaf("sel1")),
                Box::new(Composition::Not(Box::new(Composition::leaf("sel2"))))
            )
        );
        assert_eq!(
            composition.leaves(),
            vec![Arc::<str>::from("sel1"), Arc::<str>::from("sel2")]
        );
        assert_eq!(composition.to_json(), json!(["AND", "sel1", ["NOT", "sel2"]]));
    }

    #[test]
    fn operators_are_case_insensitive() {
        let composition = Composition::from_json(&json!(["any", "a", "b", "c"])).unwrap();
        assert_eq!(
            composition,
            Composition::AnyOf(vec![
                Composition::leaf("a"),
                Composition::leaf("b"),
                Composition::leaf("c")
            ])
        );
    }

    #[rstest]
    #[case(json!([]))]
    #[case(json!(["NOT"]))]
    #[case(json!(["NOT", "a", "b"]))]
    #[case(json!(["AND", "a"]))]
    #[case(json!(["XOR", "a", "b", "c"]))]
    #[case(json!(["NONE"]))]
    #[case(json!(["NAND", "a", "b"]))]
    #[case(json!([3, "a"]))]
    #[case(json!(""))]
    #[case(json!(42))]
    fn rejects_invalid(#[case] value: Value) {
        let err = Composition::from_json(&value).unwrap_err();
        assert!(err.is_composition_parse(), "{err}");
    }

    #[test]
    fn display_is_json() {
        let composition = Composition::NoneOf(vec![Composition::leaf("x")]);
        assert_eq!(composition.to_string(), r#"["NONE","x"]"#);
    }
}
