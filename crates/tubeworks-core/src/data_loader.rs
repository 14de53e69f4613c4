//! Data-driven registry loading from JSON.
//!
//! Feature-gated behind `data-loader`. Resource types, recipes, and block
//! templates come from data files; mod-supplied custom behaviors still
//! register their factories in code and are referenced here by type name.

use crate::fixed::Fixed64;
use crate::geom::{Direction, Footprint};
use crate::registry::{BehaviorProto, RegistryBuilder};
use crate::resource::ResourceStack;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during data loading.
#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("unknown resource reference: {0}")]
    UnknownResourceRef(String),
    #[error("unknown recipe reference: {0}")]
    UnknownRecipeRef(String),
    #[error("unknown direction: {0}")]
    UnknownDirection(String),
}

// ---------------------------------------------------------------------------
// JSON data structures
// ---------------------------------------------------------------------------

/// Top-level registry data for JSON deserialization.
#[derive(Debug, serde::Deserialize)]
pub struct RegistryData {
    #[serde(default)]
    pub resources: Vec<ResourceData>,
    #[serde(default)]
    pub recipes: Vec<RecipeData>,
    #[serde(default)]
    pub blocks: Vec<BlockTemplateData>,
}

/// JSON representation of a resource type.
#[derive(Debug, serde::Deserialize)]
pub struct ResourceData {
    pub name: String,
}

/// JSON representation of a recipe.
#[derive(Debug, serde::Deserialize)]
pub struct RecipeData {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<StackData>,
    pub output: StackData,
    pub duration: u64,
}

/// JSON representation of a resource stack (by resource name).
#[derive(Debug, serde::Deserialize)]
pub struct StackData {
    pub resource: String,
    pub quantity: u32,
}

/// JSON representation of a block template.
#[derive(Debug, serde::Deserialize)]
pub struct BlockTemplateData {
    pub name: String,
    #[serde(default = "default_extent")]
    pub width: u32,
    #[serde(default = "default_extent")]
    pub height: u32,
    pub behavior: BehaviorData,
}

fn default_extent() -> u32 {
    1
}

/// JSON representation of a behavior prototype.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BehaviorData {
    Producer {
        resource: String,
        quantity: u32,
        interval: u64,
        output_capacity: u32,
        port: String,
        #[serde(default)]
        require_ore: bool,
    },
    Consumer {
        #[serde(default)]
        accepts: Option<String>,
        capacity: u32,
        port: String,
        #[serde(default)]
        consume_rate: u32,
    },
    Storage {
        capacity: u32,
        ports: Vec<String>,
    },
    Converter {
        #[serde(default)]
        recipe: Option<String>,
        input_capacity: u32,
        output_capacity: u32,
        in_port: String,
        out_port: String,
    },
    Tube {
        speed: f64,
        lane_capacity: u32,
        #[serde(default)]
        closed: Vec<String>,
    },
    Custom {
        type_name: String,
    },
}

// ---------------------------------------------------------------------------
// Loading functions
// ---------------------------------------------------------------------------

/// Load a registry builder from a JSON string.
pub fn load_registry_json(json: &str) -> Result<RegistryBuilder, DataLoadError> {
    let data: RegistryData = serde_json::from_str(json)?;
    build_registry(data)
}

/// Load a registry builder from JSON bytes.
pub fn load_registry_json_bytes(bytes: &[u8]) -> Result<RegistryBuilder, DataLoadError> {
    let data: RegistryData = serde_json::from_slice(bytes)?;
    build_registry(data)
}

fn parse_direction(name: &str) -> Result<Direction, DataLoadError> {
    match name {
        "north" => Ok(Direction::North),
        "east" => Ok(Direction::East),
        "south" => Ok(Direction::South),
        "west" => Ok(Direction::West),
        other => Err(DataLoadError::UnknownDirection(other.to_string())),
    }
}

fn build_registry(data: RegistryData) -> Result<RegistryBuilder, DataLoadError> {
    let mut builder = RegistryBuilder::new();

    // Resources first so recipes and blocks can resolve them by name.
    for resource in &data.resources {
        builder.register_resource(&resource.name);
    }
    let resolve_resource = |builder: &RegistryBuilder, name: &str| {
        builder
            .preview_resource(name)
            .ok_or_else(|| DataLoadError::UnknownResourceRef(name.to_string()))
    };

    for recipe in &data.recipes {
        let mut inputs = Vec::with_capacity(recipe.inputs.len());
        for input in &recipe.inputs {
            inputs.push(ResourceStack::new(
                resolve_resource(&builder, &input.resource)?,
                input.quantity,
            ));
        }
        let output = ResourceStack::new(
            resolve_resource(&builder, &recipe.output.resource)?,
            recipe.output.quantity,
        );
        builder.register_recipe(&recipe.name, inputs, output, recipe.duration);
    }

    for block in &data.blocks {
        let proto = match &block.behavior {
            BehaviorData::Producer {
                resource,
                quantity,
                interval,
                output_capacity,
                port,
                require_ore,
            } => BehaviorProto::Producer {
                resource: resolve_resource(&builder, resource)?,
                quantity: *quantity,
                interval: *interval,
                output_capacity: *output_capacity,
                port: parse_direction(port)?,
                require_ore: *require_ore,
            },
            BehaviorData::Consumer {
                accepts,
                capacity,
                port,
                consume_rate,
            } => BehaviorProto::Consumer {
                accepts: accepts
                    .as_deref()
                    .map(|name| resolve_resource(&builder, name))
                    .transpose()?,
                capacity: *capacity,
                port: parse_direction(port)?,
                consume_rate: *consume_rate,
            },
            BehaviorData::Storage { capacity, ports } => BehaviorProto::Storage {
                capacity: *capacity,
                ports: ports
                    .iter()
                    .map(|p| parse_direction(p))
                    .collect::<Result<_, _>>()?,
            },
            BehaviorData::Converter {
                recipe,
                input_capacity,
                output_capacity,
                in_port,
                out_port,
            } => BehaviorProto::Converter {
                recipe: recipe
                    .as_deref()
                    .map(|name| {
                        builder
                            .preview_recipe(name)
                            .ok_or_else(|| DataLoadError::UnknownRecipeRef(name.to_string()))
                    })
                    .transpose()?,
                input_capacity: *input_capacity,
                output_capacity: *output_capacity,
                in_port: parse_direction(in_port)?,
                out_port: parse_direction(out_port)?,
            },
            BehaviorData::Tube {
                speed,
                lane_capacity,
                closed,
            } => BehaviorProto::Tube {
                speed: Fixed64::from_num(*speed),
                lane_capacity: *lane_capacity,
                closed: closed
                    .iter()
                    .map(|p| parse_direction(p))
                    .collect::<Result<_, _>>()?,
            },
            BehaviorData::Custom { type_name } => BehaviorProto::Custom {
                type_name: type_name.clone(),
            },
        };
        builder.register_block(
            &block.name,
            Footprint::new(block.width, block.height),
            proto,
        );
    }

    Ok(builder)
}
