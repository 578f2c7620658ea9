use std::{collections::BTreeMap, process::ExitCode};

use anyhow::Result;
use http::Method;
use outrig_core::{
    config::{Capabilities, TypeInfo},
    contracts::{
        DataProcessorRequest, DataProcessorResponse, FormatsResponse, DATA_PROCESSOR,
        FORMATS_ENDPOINT, PROCESS_ENDPOINT,
    },
    error::ErrorEnvelope,
};
use outrig_sdk::Endpoint;

const SCHEMA: &str = r#"{"type": "object", "properties": {"format": {"type": "string"}}}"#;

fn capabilities() -> Capabilities {
    Capabilities::default().with_type(
        DATA_PROCESSOR,
        TypeInfo {
            type_name: "simple-text-processor".into(),
            json_schema: SCHEMA.as_bytes().to_vec(),
        },
    )
}

async fn process(request: DataProcessorRequest) -> Result<DataProcessorResponse, ErrorEnvelope> {
    let text = String::from_utf8_lossy(&request.data).to_uppercase();
    tracing::debug!(bytes = request.data.len(), format = %request.format, "processing data");
    Ok(DataProcessorResponse {
        data: text.into_bytes(),
        format: request.format,
        metadata: BTreeMap::from([
            ("processed_by".to_string(), "simple-processor".into()),
            ("operation".to_string(), "uppercase".into()),
        ]),
    })
}

async fn formats(_: serde_json::Value) -> Result<FormatsResponse, ErrorEnvelope> {
    Ok(FormatsResponse {
        formats: vec!["text/plain".to_string(), "text".to_string()],
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    outrig_sdk::run(capabilities(), |config| {
        tracing::info!(plugin = %config.id, "starting simple processor");
        Ok(vec![
            Endpoint::json(Method::POST, PROCESS_ENDPOINT, process),
            Endpoint::json(Method::GET, FORMATS_ENDPOINT, formats),
        ])
    })
    .await
}
