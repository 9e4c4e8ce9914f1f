//! AWS Batch job submitter.
//!
//! The group key travels as one container environment variable, set through
//! an EKS pod override or an ECS container override depending on what the
//! job definition targets.

use async_trait::async_trait;
use aws_sdk_batch::Client;
use aws_sdk_batch::error::DisplayErrorContext;
use aws_sdk_batch::types::{
    ContainerOverrides, EksContainerEnvironmentVariable, EksContainerOverride,
    EksPodPropertiesOverride, EksPropertiesOverride, KeyValuePair,
};

use super::{JobRequest, JobSubmitter};
use crate::config::JobPlatform;
use crate::error::{Error, Result};

pub struct AwsBatchSubmitter {
    client: Client,
    platform: JobPlatform,
}

impl AwsBatchSubmitter {
    pub fn new(client: Client, platform: JobPlatform) -> Self {
        Self { client, platform }
    }

    /// Build a client from the ambient AWS configuration.
    pub async fn from_env(platform: JobPlatform) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config), platform)
    }
}

fn submission_error(request: &JobRequest, message: impl Into<String>) -> Error {
    Error::Submission {
        group: request.parameter.value.clone(),
        message: message.into(),
    }
}

#[async_trait]
impl JobSubmitter for AwsBatchSubmitter {
    async fn submit(&self, request: &JobRequest) -> Result<String> {
        let call = self
            .client
            .submit_job()
            .job_name(&request.job_name)
            .job_definition(&request.job_definition)
            .job_queue(&request.job_queue);

        let call = match self.platform {
            JobPlatform::Eks => {
                let env = EksContainerEnvironmentVariable::builder()
                    .name(&request.parameter.name)
                    .value(&request.parameter.value)
                    .build();
                let container = EksContainerOverride::builder().env(env).build();
                let pod = EksPodPropertiesOverride::builder()
                    .containers(container)
                    .build();
                call.eks_properties_override(
                    EksPropertiesOverride::builder().pod_properties(pod).build(),
                )
            }
            JobPlatform::Ecs => {
                let env = KeyValuePair::builder()
                    .name(&request.parameter.name)
                    .value(&request.parameter.value)
                    .build();
                call.container_overrides(ContainerOverrides::builder().environment(env).build())
            }
        };

        let output = call
            .send()
            .await
            .map_err(|e| submission_error(request, DisplayErrorContext(&e).to_string()))?;
        output
            .job_id()
            .map(str::to_string)
            .ok_or_else(|| submission_error(request, "response did not include a job id"))
    }
}
