//! Metric names recorded through OpenTelemetry.
//! See: https://opentelemetry.io/docs/specs/semconv/gen-ai/gen-ai-metrics/

/// HTTP server request duration in milliseconds.
pub const HTTP_SERVER_REQUEST_DURATION: &str = "http.server.request.duration";

/// Duration of a model call, from admission to the last byte.
pub const GEN_AI_CLIENT_OPERATION_DURATION: &str = "gen_ai.client.operation.duration";

/// Time until the first streamed chunk arrives.
pub const GEN_AI_CLIENT_TIME_TO_FIRST_TOKEN: &str = "gen_ai.client.time_to_first_token";

/// Prompt tokens per call.
pub const GEN_AI_CLIENT_INPUT_TOKEN_USAGE: &str = "gen_ai.client.input.token.usage";

/// Completion tokens per call.
pub const GEN_AI_CLIENT_OUTPUT_TOKEN_USAGE: &str = "gen_ai.client.output.token.usage";

/// Total tokens per call.
pub const GEN_AI_CLIENT_TOTAL_TOKEN_USAGE: &str = "gen_ai.client.total.token.usage";

/// Duration of one rate limit storage command against Redis.
pub const REDIS_COMMAND_DURATION: &str = "tianji.redis.command.duration";

/// Guardrail check duration.
pub const GUARDRAIL_CHECK_DURATION: &str = "tianji.guardrail.check.duration";
