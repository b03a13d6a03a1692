//! OpenTelemetry instruments of the chat completion pipeline.

use opentelemetry::{Key, KeyValue, Value, metrics::Counter};
use telemetry::metrics::{
    GEN_AI_CLIENT_INPUT_TOKEN_USAGE, GEN_AI_CLIENT_OPERATION_DURATION, GEN_AI_CLIENT_OUTPUT_TOKEN_USAGE,
    GEN_AI_CLIENT_TIME_TO_FIRST_TOKEN, GEN_AI_CLIENT_TOTAL_TOKEN_USAGE, Recorder,
};

use crate::{messages::Usage, provider::ResolvedModel};

const SYSTEM: &str = "tianji.llm";

/// Token counters shared by every call.
pub(super) struct OperationMetrics {
    input_token_counter: Counter<u64>,
    output_token_counter: Counter<u64>,
    total_token_counter: Counter<u64>,
}

impl OperationMetrics {
    pub fn new() -> Self {
        let meter = telemetry::metrics::meter();

        Self {
            input_token_counter: meter.u64_counter(GEN_AI_CLIENT_INPUT_TOKEN_USAGE).build(),
            output_token_counter: meter.u64_counter(GEN_AI_CLIENT_OUTPUT_TOKEN_USAGE).build(),
            total_token_counter: meter.u64_counter(GEN_AI_CLIENT_TOTAL_TOKEN_USAGE).build(),
        }
    }

    /// Duration of the whole call, recorded when the call finishes.
    pub fn operation_recorder(model: &ResolvedModel, stream: bool) -> Recorder {
        let mut recorder = recorder(GEN_AI_CLIENT_OPERATION_DURATION, model);
        recorder.push_attribute("gen_ai.request.stream", stream);

        recorder
    }

    /// Time to the first streamed chunk carrying content or a tool call.
    pub fn ttft_recorder(model: &ResolvedModel) -> Recorder {
        recorder(GEN_AI_CLIENT_TIME_TO_FIRST_TOKEN, model)
    }

    /// Token counts reported by the upstream. Estimates never reach these counters.
    pub fn record_usage(&self, model: &ResolvedModel, usage: &Usage) {
        let attributes = [
            KeyValue::new(Key::from("gen_ai.system"), Value::from(SYSTEM)),
            KeyValue::new(Key::from("gen_ai.request.model"), Value::from(model.public_name.clone())),
            KeyValue::new(Key::from("gen_ai.provider.name"), Value::from(model.provider.clone())),
        ];

        self.input_token_counter.add(u64::from(usage.prompt_tokens), &attributes);
        self.output_token_counter.add(u64::from(usage.completion_tokens), &attributes);
        self.total_token_counter.add(u64::from(usage.total_tokens), &attributes);
    }
}

fn recorder(name: &'static str, model: &ResolvedModel) -> Recorder {
    let mut recorder = Recorder::new(name);

    recorder.push_attribute("gen_ai.system", SYSTEM);
    recorder.push_attribute("gen_ai.operation.name", "chat.completions");
    recorder.push_attribute("gen_ai.request.model", model.public_name.clone());
    recorder.push_attribute("gen_ai.provider.name", model.provider.clone());

    recorder
}
