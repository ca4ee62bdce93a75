use std::fs;

use plan3d_contracts::assets::{data_url, mime_for_path, AssetRef};
use plan3d_contracts::errors::ServiceError;
use plan3d_contracts::history::{parse_history, HistoryEntry};
use plan3d_contracts::jobs::{JobId, JobSnapshot};
use plan3d_contracts::services::extract::extract_result;
use plan3d_contracts::services::{
    EndpointRegistry, EndpointSpec, ServiceCall, ServiceKind, ServiceOutput, Vendor,
};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Map, Value};

use crate::config::EngineConfig;
use crate::history::HistorySource;
use crate::poller::JobStatusSource;

/// Typed gateway to the remote inference services.
pub trait ServiceAdapter: Send + Sync {
    fn invoke(&self, call: &ServiceCall) -> Result<ServiceOutput, ServiceError>;
}

/// Talks to fal-style synchronous endpoints and Meshy-style submit/poll endpoints.
pub struct HttpServiceAdapter {
    config: EngineConfig,
    endpoints: EndpointRegistry,
    http: HttpClient,
}

impl HttpServiceAdapter {
    pub fn new(config: EngineConfig) -> Self {
        let endpoints = config.endpoint_registry();
        Self {
            config,
            endpoints,
            http: HttpClient::new(),
        }
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    fn endpoint(&self, service: ServiceKind) -> Result<&EndpointSpec, ServiceError> {
        self.endpoints
            .get(service)
            .ok_or_else(|| ServiceError::NotConfigured {
                service,
                detail: "no endpoint registered".to_string(),
            })
    }

    fn authorize(
        &self,
        service: ServiceKind,
        vendor: Vendor,
        request: RequestBuilder,
    ) -> Result<RequestBuilder, ServiceError> {
        match (vendor, self.config.api_key(vendor)) {
            (Vendor::Fal, Some(key)) => Ok(request.header(AUTHORIZATION, format!("Key {key}"))),
            (Vendor::Meshy, Some(key)) => Ok(request.bearer_auth(key)),
            (_, None) if self.config.uses_proxy_for(vendor) => Ok(request),
            (Vendor::Fal, None) => Err(ServiceError::NotConfigured {
                service,
                detail: "FAL_KEY (or FAL_API_KEY) not set".to_string(),
            }),
            (Vendor::Meshy, None) => Err(ServiceError::NotConfigured {
                service,
                detail: "MESHY_API_KEY not set".to_string(),
            }),
        }
    }

    fn post_json(
        &self,
        spec: &EndpointSpec,
        payload: &Map<String, Value>,
    ) -> Result<Value, ServiceError> {
        let url = spec.url(self.config.api_base(spec.vendor));
        let request = self.authorize(spec.service, spec.vendor, self.http.post(&url))?;
        let response = request
            .json(payload)
            .send()
            .map_err(|err| network_error(spec.service, &url, &err))?;
        response_json_or_error(spec.service, response)
    }

    fn get_json(&self, spec: &EndpointSpec, url: &str) -> Result<Value, ServiceError> {
        let request = self.authorize(spec.service, spec.vendor, self.http.get(url))?;
        let response = request
            .send()
            .map_err(|err| network_error(spec.service, url, &err))?;
        response_json_or_error(spec.service, response)
    }

    /// Meshy listing and detail endpoints share the mesh-generation path.
    fn meshy_tasks_endpoint(&self) -> Result<&EndpointSpec, ServiceError> {
        let spec = self.endpoint(ServiceKind::MeshGeneration)?;
        if spec.vendor != Vendor::Meshy {
            return Err(ServiceError::NotConfigured {
                service: ServiceKind::MeshGeneration,
                detail: format!(
                    "job history needs a meshy mesh-generation endpoint (configured: {})",
                    spec.vendor
                ),
            });
        }
        Ok(spec)
    }
}

impl ServiceAdapter for HttpServiceAdapter {
    fn invoke(&self, call: &ServiceCall) -> Result<ServiceOutput, ServiceError> {
        let service = call.service();
        let spec = self.endpoint(service)?;
        let image_url = input_url(service, call.image())?;
        let payload = request_payload(call, spec.vendor, image_url);
        let response = self.post_json(spec, &payload)?;
        normalize_output(service, spec.vendor, &response)
    }
}

impl JobStatusSource for HttpServiceAdapter {
    fn fetch_status(&self, job_id: &JobId) -> Result<JobSnapshot, ServiceError> {
        let spec = self.endpoint(ServiceKind::MeshGeneration)?;
        let url = format!("{}/{}", spec.url(self.config.api_base(spec.vendor)), job_id);
        let payload = self.get_json(spec, &url)?;
        JobSnapshot::from_value(&payload).ok_or(ServiceError::NoResultField {
            service: ServiceKind::MeshGeneration,
        })
    }
}

impl HistorySource for HttpServiceAdapter {
    fn list_recent(&self, page_size: usize) -> Result<Vec<HistoryEntry>, ServiceError> {
        let spec = self.meshy_tasks_endpoint()?;
        let page_size = page_size.clamp(1, 50);
        let url = format!(
            "{}?page_num=1&page_size={page_size}&sort_by=-created_at",
            spec.url(self.config.api_base(spec.vendor))
        );
        let payload = self.get_json(spec, &url)?;
        Ok(parse_history(&payload, page_size))
    }

    fn job_detail(&self, task_id: &str) -> Result<HistoryEntry, ServiceError> {
        let spec = self.meshy_tasks_endpoint()?;
        let url = format!(
            "{}/{}",
            spec.url(self.config.api_base(spec.vendor)),
            task_id.trim()
        );
        let payload = self.get_json(spec, &url)?;
        HistoryEntry::from_value(&payload).ok_or(ServiceError::NoResultField {
            service: ServiceKind::MeshGeneration,
        })
    }
}

/// Remote and inline references pass through; local files are inlined as data URLs.
pub fn input_url(service: ServiceKind, image: &AssetRef) -> Result<String, ServiceError> {
    match image {
        AssetRef::Remote(url) | AssetRef::Inline(url) => Ok(url.clone()),
        AssetRef::Local(path) => {
            let Some(mime) = mime_for_path(path).filter(|mime| mime.starts_with("image/")) else {
                return Err(ServiceError::InvalidInput {
                    service,
                    detail: format!("unsupported image type: {}", path.display()),
                });
            };
            let bytes = fs::read(path).map_err(|err| ServiceError::InvalidInput {
                service,
                detail: format!("failed reading {}: {err}", path.display()),
            })?;
            Ok(data_url(mime, &bytes))
        }
    }
}

/// Builds the vendor request body for `call`.
pub fn request_payload(call: &ServiceCall, vendor: Vendor, image_url: String) -> Map<String, Value> {
    match call {
        ServiceCall::Segment { .. } | ServiceCall::EstimateDepth { .. } => {
            map_object(json!({ "image_url": image_url }))
        }
        ServiceCall::GenerateMesh { options, .. } => {
            let mut payload = match vendor {
                Vendor::Meshy => map_object(json!({
                    "image_url": image_url,
                    "target_polycount": options.target_polycount,
                    "symmetry_mode": options.symmetry_mode.as_str(),
                    "should_texture": true,
                    "enable_pbr": options.enable_pbr,
                })),
                Vendor::Fal => map_object(json!({
                    "image_url": image_url,
                    "texture_size": options.texture_resolution,
                })),
            };
            if let Some(texture_prompt) = options.texture_prompt.as_ref() {
                payload.insert(
                    "texture_prompt".to_string(),
                    Value::String(texture_prompt.clone()),
                );
            }
            if let Some(prompt) = options.prompt.as_ref() {
                payload.insert("prompt".to_string(), Value::String(prompt.clone()));
            }
            payload
        }
        ServiceCall::ImageToImage { options, .. } => {
            let options = options.clamped();
            map_object(json!({
                "image_url": image_url,
                "prompt": options.prompt,
                "strength": options.strength,
                "guidance_scale": options.guidance_scale,
                "num_inference_steps": options.inference_steps,
            }))
        }
    }
}

/// Meshy submits answer `{result: taskId}`; everything else must carry a result URL.
pub fn normalize_output(
    service: ServiceKind,
    vendor: Vendor,
    response: &Value,
) -> Result<ServiceOutput, ServiceError> {
    if vendor == Vendor::Meshy {
        if let Some(task_id) = response
            .get("result")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return Ok(ServiceOutput::Job(JobId::new(task_id)));
        }
    }
    extract_result(response)
        .map(|(_, asset)| ServiceOutput::Asset(asset))
        .ok_or(ServiceError::NoResultField { service })
}

fn response_json_or_error(
    service: ServiceKind,
    response: HttpResponse,
) -> Result<Value, ServiceError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response.text().map_err(|err| ServiceError::Network {
        service,
        detail: format!("response body read failed: {err}"),
    })?;
    if !status.is_success() {
        return Err(ServiceError::Http {
            service,
            status: code,
            body: truncate_text(&body, 512),
        });
    }
    serde_json::from_str(&body).map_err(|_| ServiceError::Http {
        service,
        status: code,
        body: format!("invalid JSON payload: {}", truncate_text(&body, 256)),
    })
}

fn network_error(service: ServiceKind, url: &str, err: &reqwest::Error) -> ServiceError {
    ServiceError::Network {
        service,
        detail: format!("request to {url} failed: {err}"),
    }
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
