use std::{collections::BTreeMap, process::ExitCode};

use anyhow::Result;
use http::Method;
use outrig_core::{
    config::{Capabilities, TypeInfo},
    contracts::{
        ParameterInfo, TransformRequest, TransformResponse, TransformationInfo,
        TransformationsResponse, TRANSFORMATIONS_ENDPOINT, TRANSFORMER, TRANSFORM_ENDPOINT,
    },
    error::ErrorEnvelope,
};
use outrig_sdk::Endpoint;
use serde_json::Value;

const SCHEMA: &str = r#"{"type": "object", "properties": {"transformation": {"type": "string"}}}"#;

fn capabilities() -> Capabilities {
    Capabilities::default().with_type(
        TRANSFORMER,
        TypeInfo {
            type_name: "simple-text-transformer".into(),
            json_schema: SCHEMA.as_bytes().to_vec(),
        },
    )
}

fn catalogue() -> Vec<TransformationInfo> {
    vec![
        TransformationInfo {
            name: "reverse".into(),
            description: "Reverses the characters of the input".into(),
            parameters: Vec::new(),
        },
        TransformationInfo {
            name: "repeat".into(),
            description: "Repeats the input".into(),
            parameters: vec![ParameterInfo {
                name: "times".into(),
                type_name: "integer".into(),
                required: false,
                default: Some(Value::from(2)),
                description: "How many copies to emit".into(),
            }],
        },
    ]
}

async fn transform(request: TransformRequest) -> Result<TransformResponse, ErrorEnvelope> {
    let text = String::from_utf8_lossy(&request.data);
    let output = match request.transformation.as_str() {
        "reverse" => text.chars().rev().collect::<String>(),
        "repeat" => {
            let times = match request.parameters.get("times") {
                None => 2,
                Some(value) => value
                    .as_u64()
                    .filter(|n| *n <= 64)
                    .ok_or_else(|| ErrorEnvelope::new(400, "times must be an integer between 0 and 64"))?,
            };
            text.repeat(times as usize)
        }
        other => {
            return Err(ErrorEnvelope::new(400, format!("unknown transformation {other:?}")));
        }
    };
    Ok(TransformResponse {
        data: output.into_bytes(),
        metadata: BTreeMap::from([(
            "transformation".to_string(),
            Value::from(request.transformation),
        )]),
    })
}

async fn transformations(_: Value) -> Result<TransformationsResponse, ErrorEnvelope> {
    Ok(TransformationsResponse {
        transformations: catalogue(),
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    outrig_sdk::run(capabilities(), |config| {
        tracing::info!(plugin = %config.id, "starting simple transformer");
        Ok(vec![
            Endpoint::json(Method::POST, TRANSFORM_ENDPOINT, transform),
            Endpoint::json(Method::GET, TRANSFORMATIONS_ENDPOINT, transformations),
        ])
    })
    .await
}
