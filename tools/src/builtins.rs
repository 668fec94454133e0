//! Reference model tools operating on [`MemoryModel`].
//!
//! These are deliberately thin: the engine does not know what they do, only
//! whether they mutate and whether they need approval.

use std::collections::BTreeMap;
use std::sync::Arc;

use bimlink_model::{ElementId, MemoryModel, ModelError, NewElement};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{ToolCtx, ToolError, ToolExecutor, ToolFut, ToolOutput, ToolRegistry, parse_args};

pub struct GetLevelsTool;
pub struct ListElementsTool;
pub struct PlaceElementTool;
pub struct SetParameterTool;
pub struct DeleteElementTool;

#[derive(Debug, Deserialize)]
struct ListElementsArgs {
    category: Option<String>,
    level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaceElementArgs {
    category: String,
    name: String,
    level: String,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct SetParameterArgs {
    element_id: u64,
    name: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct DeleteElementArgs {
    element_id: u64,
}

fn model_error(tool: &str, model: &MemoryModel, err: ModelError) -> ToolError {
    let message = match err {
        ModelError::ElementNotFound { id } => {
            let ids: Vec<String> = model.element_ids().iter().map(ToString::to_string).collect();
            if ids.is_empty() {
                format!("element {id} not found; the model has no elements")
            } else {
                format!(
                    "element {id} not found. Valid element ids: {}. Use list_elements to inspect them.",
                    ids.join(", ")
                )
            }
        }
        other => other.to_string(),
    };
    ToolError::ExecutionFailed {
        tool: tool.to_string(),
        message,
    }
}

impl ToolExecutor for GetLevelsTool {
    fn name(&self) -> &'static str {
        "get_levels"
    }

    fn description(&self) -> &'static str {
        "List the levels defined in the model"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {}
        })
    }

    fn requires_transaction(&self) -> bool {
        false
    }

    fn execute<'a>(&'a self, _args: Value, ctx: &'a mut ToolCtx<'_>) -> ToolFut<'a> {
        Box::pin(async move {
            let model = ctx.document_as::<MemoryModel>(self.name())?;
            Ok(ToolOutput::text(json!({ "levels": model.levels() }).to_string()))
        })
    }
}

impl ToolExecutor for ListElementsTool {
    fn name(&self) -> &'static str {
        "list_elements"
    }

    fn description(&self) -> &'static str {
        "List model elements, optionally filtered by category and level"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "category": {
                    "type": "string",
                    "description": "Only elements of this category (e.g. 'Walls')."
                },
                "level": {
                    "type": "string",
                    "description": "Only elements hosted on this level."
                }
            }
        })
    }

    fn requires_transaction(&self) -> bool {
        false
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a mut ToolCtx<'_>) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: ListElementsArgs = if args.is_null() {
                ListElementsArgs {
                    category: None,
                    level: None,
                }
            } else {
                parse_args(&args)?
            };
            let model = ctx.document_as::<MemoryModel>(self.name())?;
            let elements: Vec<_> = model
                .elements()
                .filter(|e| {
                    typed
                        .category
                        .as_deref()
                        .is_none_or(|c| e.category.eq_ignore_ascii_case(c))
                })
                .filter(|e| typed.level.as_deref().is_none_or(|l| e.level == l))
                .collect();
            let body = serde_json::to_string(&elements).map_err(|e| ToolError::ExecutionFailed {
                tool: self.name().to_string(),
                message: e.to_string(),
            })?;
            Ok(ToolOutput::text(body))
        })
    }
}

impl ToolExecutor for PlaceElementTool {
    fn name(&self) -> &'static str {
        "place_element"
    }

    fn description(&self) -> &'static str {
        "Place a new element of the given category on a level"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "category": {"type": "string", "description": "Element category, e.g. 'Walls'."},
                "name": {"type": "string", "description": "Type name of the new element."},
                "level": {"type": "string", "description": "Level name; see get_levels."},
                "parameters": {
                    "type": "object",
                    "description": "Initial parameter values."
                }
            },
            "required": ["category", "name", "level"]
        })
    }

    fn requires_transaction(&self) -> bool {
        true
    }

    fn dry_run_description(&self, args: &Value) -> String {
        match parse_args::<PlaceElementArgs>(args) {
            Ok(typed) => format!(
                "Would place {} '{}' on {}",
                typed.category, typed.name, typed.level
            ),
            Err(_) => format!("Would place an element with arguments {args}"),
        }
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a mut ToolCtx<'_>) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: PlaceElementArgs = parse_args(&args)?;
            ctx.check_cancelled()?;
            let model = ctx.document_as::<MemoryModel>(self.name())?;
            let category = typed.category.clone();
            let level = typed.level.clone();
            let name = typed.name.clone();
            let id = model
                .insert_element(NewElement {
                    category: typed.category,
                    name: typed.name,
                    level: typed.level,
                    parameters: typed.parameters,
                })
                .map_err(|e| model_error(self.name(), model, e))?;
            Ok(ToolOutput::text(format!(
                "Placed {category} '{name}' on {level} (element id {id})"
            )))
        })
    }
}

impl ToolExecutor for SetParameterTool {
    fn name(&self) -> &'static str {
        "set_parameter"
    }

    fn description(&self) -> &'static str {
        "Set a parameter value on an existing element"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "element_id": {"type": "integer", "minimum": 1},
                "name": {"type": "string", "description": "Parameter name."},
                "value": {"description": "New parameter value."}
            },
            "required": ["element_id", "name", "value"]
        })
    }

    fn requires_transaction(&self) -> bool {
        true
    }

    fn dry_run_description(&self, args: &Value) -> String {
        match parse_args::<SetParameterArgs>(args) {
            Ok(typed) => format!(
                "Would set '{}' = {} on element {}",
                typed.name, typed.value, typed.element_id
            ),
            Err(_) => format!("Would set a parameter with arguments {args}"),
        }
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a mut ToolCtx<'_>) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: SetParameterArgs = parse_args(&args)?;
            ctx.check_cancelled()?;
            let model = ctx.document_as::<MemoryModel>(self.name())?;
            let id = ElementId(typed.element_id);
            let previous = model
                .set_parameter(id, &typed.name, typed.value.clone())
                .map_err(|e| model_error(self.name(), model, e))?;
            let previous = previous.map_or_else(|| "unset".to_string(), |v| v.to_string());
            Ok(ToolOutput::text(format!(
                "Set '{}' on element {id}: {previous} -> {}",
                typed.name, typed.value
            )))
        })
    }
}

impl ToolExecutor for DeleteElementTool {
    fn name(&self) -> &'static str {
        "delete_element"
    }

    fn description(&self) -> &'static str {
        "Delete an element from the model"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "element_id": {"type": "integer", "minimum": 1}
            },
            "required": ["element_id"]
        })
    }

    fn requires_transaction(&self) -> bool {
        true
    }

    fn requires_confirmation(&self) -> bool {
        true
    }

    fn dry_run_description(&self, args: &Value) -> String {
        match parse_args::<DeleteElementArgs>(args) {
            Ok(typed) => format!("Would delete element {}", typed.element_id),
            Err(_) => format!("Would delete an element with arguments {args}"),
        }
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a mut ToolCtx<'_>) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: DeleteElementArgs = parse_args(&args)?;
            ctx.check_cancelled()?;
            let model = ctx.document_as::<MemoryModel>(self.name())?;
            let removed = model
                .remove_element(ElementId(typed.element_id))
                .map_err(|e| model_error(self.name(), model, e))?;
            Ok(ToolOutput::text(format!(
                "Deleted {} '{}' (element id {})",
                removed.category, removed.name, removed.id
            )))
        })
    }
}

pub fn register_builtins(registry: &ToolRegistry) -> Result<(), ToolError> {
    registry.register(Arc::new(GetLevelsTool))?;
    registry.register(Arc::new(ListElementsTool))?;
    registry.register(Arc::new(PlaceElementTool))?;
    registry.register(Arc::new(SetParameterTool))?;
    registry.register(Arc::new(DeleteElementTool))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bimlink_types::Document;
    use tokio_util::sync::CancellationToken;

    fn ctx(model: &mut MemoryModel) -> ToolCtx<'_> {
        ToolCtx {
            document: model,
            tool_call_id: "call-1".to_string(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn get_levels_lists_model_levels() {
        let mut model = MemoryModel::new("Test");
        let mut ctx = ctx(&mut model);
        let out = GetLevelsTool.execute(json!({}), &mut ctx).await.unwrap();
        assert_eq!(out.content, r#"{"levels":["Level 1","Level 2"]}"#);
    }

    #[tokio::test]
    async fn place_element_requires_open_transaction() {
        let mut model = MemoryModel::new("Test");
        let mut ctx = ctx(&mut model);
        let err = PlaceElementTool
            .execute(
                json!({"category": "Walls", "name": "Basic", "level": "Level 1"}),
                &mut ctx,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no transaction is open"));
    }

    #[tokio::test]
    async fn place_then_delete_inside_transaction() {
        let mut model = MemoryModel::new("Test");
        model.begin_transaction("test").unwrap();
        {
            let mut ctx = ctx(&mut model);
            let out = PlaceElementTool
                .execute(
                    json!({"category": "Walls", "name": "Basic", "level": "Level 1"}),
                    &mut ctx,
                )
                .await
                .unwrap();
            assert_eq!(out.content, "Placed Walls 'Basic' on Level 1 (element id 1)");
            let out = DeleteElementTool
                .execute(json!({"element_id": 1}), &mut ctx)
                .await
                .unwrap();
            assert!(out.content.starts_with("Deleted Walls"));
        }
        model.commit_transaction().unwrap();
        assert_eq!(model.element_count(), 0);
    }

    #[tokio::test]
    async fn delete_unknown_element_suggests_valid_ids() {
        let mut model = MemoryModel::new("Test");
        model.begin_transaction("test").unwrap();
        let mut ctx = ctx(&mut model);
        PlaceElementTool
            .execute(
                json!({"category": "Doors", "name": "Single", "level": "Level 2"}),
                &mut ctx,
            )
            .await
            .unwrap();
        let err = DeleteElementTool
            .execute(json!({"element_id": 99}), &mut ctx)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Tool execution failed: delete_element: element 99 not found. Valid element ids: 1. Use list_elements to inspect them."
        );
    }

    #[test]
    fn dry_run_descriptions_name_the_change() {
        assert_eq!(
            PlaceElementTool.dry_run_description(
                &json!({"category": "Walls", "name": "Basic", "level": "Level 1"})
            ),
            "Would place Walls 'Basic' on Level 1"
        );
        assert_eq!(
            DeleteElementTool.dry_run_description(&json!({"element_id": 3})),
            "Would delete element 3"
        );
    }

    #[test]
    fn builtins_register_once() {
        let registry = ToolRegistry::default();
        register_builtins(&registry).unwrap();
        assert_eq!(registry.len(), 5);
        assert!(register_builtins(&registry).is_err());
    }
}
