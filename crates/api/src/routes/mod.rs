pub mod runs;
pub mod stream;

use analytics_common::{AgentType, RunId};

use crate::types::{error_response, ApiResult};

pub(crate) fn parse_run_id(raw: &str) -> ApiResult<RunId> {
    raw.parse().map_err(error_response)
}

pub(crate) fn parse_agent(raw: &str) -> ApiResult<AgentType> {
    AgentType::parse(raw).map_err(error_response)
}

pub(crate) fn stream_url(run_id: RunId) -> String {
    format!("/runs/{}/stream", run_id)
}
