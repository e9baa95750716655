//! Pizza quantity calculator, exposed to the agent as a function tool.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::Tool;

const SLICES_PER_LARGE_PIZZA: u64 = 8;

/// Estimate how many large pizzas to order for a group.
pub struct CalculatePizzaForPeople;

fn slices_per_person(appetite_level: &str) -> Option<u64> {
    match appetite_level {
        "light" => Some(2),
        "normal" => Some(3),
        "heavy" => Some(4),
        _ => None,
    }
}

#[async_trait]
impl Tool for CalculatePizzaForPeople {
    fn name(&self) -> &str {
        "calculate_pizza_for_people"
    }

    fn description(&self) -> &str {
        "Calculate how many large pizzas to order for a number of people. Use when the user asks how much pizza they need."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "people_count": {
                    "type": "integer",
                    "description": "Number of people eating"
                },
                "appetite_level": {
                    "type": "string",
                    "enum": ["light", "normal", "heavy"],
                    "description": "How hungry the group is (default: normal)"
                }
            },
            "required": ["people_count"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let people_count = args["people_count"]
            .as_u64()
            .ok_or_else(|| anyhow::anyhow!("Missing 'people_count' argument"))?;
        let appetite_level = args["appetite_level"].as_str().unwrap_or("normal");
        let per_person = slices_per_person(appetite_level)
            .ok_or_else(|| anyhow::anyhow!("Unknown appetite level: {}", appetite_level))?;

        if people_count == 0 {
            return Ok("No pizza needed for 0 people.".to_string());
        }

        let too_large = || anyhow::anyhow!("people_count too large: {}", people_count);
        let slices = people_count.checked_mul(per_person).ok_or_else(too_large)?;
        let pizzas = slices.div_ceil(SLICES_PER_LARGE_PIZZA);
        let ordered_slices = pizzas
            .checked_mul(SLICES_PER_LARGE_PIZZA)
            .ok_or_else(too_large)?;
        tracing::debug!(people_count, appetite_level, pizzas, "Calculated pizza order");

        Ok(format!(
            "For {} people with {} appetites, order {} large {} ({} slices).",
            people_count,
            appetite_level,
            pizzas,
            if pizzas == 1 { "pizza" } else { "pizzas" },
            ordered_slices
        ))
    }
}
