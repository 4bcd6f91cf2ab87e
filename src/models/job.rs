//! Job-listing record for listing-feed deployments.
//!
//! The listing APIs this deployment targets respond with a JSON envelope
//! (`code`/`message`/`data.list`); [`decode_listing_payload`] unwraps it
//! into raw [`JobListing`] records.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use super::{Crawlable, Document};

/// Raw listing record as it appears in the feed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListing {
    pub job_id: String,
    #[serde(default)]
    pub security_id: String,
    pub job_name: String,
    #[serde(default)]
    pub salary_desc: String,
    #[serde(default)]
    pub brand_name: String,
    #[serde(default)]
    pub brand_scale_name: String,
    #[serde(default)]
    pub city_name: String,
    #[serde(default)]
    pub area_district: String,
    #[serde(default)]
    pub business_district: String,
    #[serde(default)]
    pub job_labels: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub job_experience: String,
    #[serde(default)]
    pub job_degree: String,
    #[serde(default)]
    pub welfare_list: Vec<String>,
}

impl Crawlable for JobListing {
    type Doc = JobListingDoc;

    fn to_document(&self) -> JobListingDoc {
        JobListingDoc {
            id: self.job_id.clone(),
            title: self.job_name.clone(),
            salary: self.salary_desc.clone(),
            company: self.brand_name.clone(),
            company_scale: self.brand_scale_name.clone(),
            city: self.city_name.clone(),
            district: self.area_district.clone(),
            business_area: self.business_district.clone(),
            labels: self.job_labels.clone(),
            skills: self.skills.clone(),
            experience: self.job_experience.clone(),
            degree: self.job_degree.clone(),
            perks: self.welfare_list.clone(),
            embedding: None,
        }
    }
}

/// Search document for a job listing. The `embedding` field is declared
/// `dense_vector` in the mapping so the index supports KNN retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListingDoc {
    pub id: String,
    pub title: String,
    pub salary: String,
    pub company: String,
    pub company_scale: String,
    pub city: String,
    pub district: String,
    pub business_area: String,
    pub labels: Vec<String>,
    pub skills: Vec<String>,
    pub experience: String,
    pub degree: String,
    pub perks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Dimensionality of the embedding model used by this deployment.
const EMBEDDING_DIMS: usize = 768;

impl Document for JobListingDoc {
    fn id(&self) -> &str {
        &self.id
    }

    fn index_name() -> &'static str {
        "job_listings"
    }

    fn type_mapping() -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "properties": {
                "id": { "type": "keyword" },
                "title": { "type": "text" },
                "salary": { "type": "keyword" },
                "company": { "type": "keyword" },
                "company_scale": { "type": "keyword" },
                "city": { "type": "keyword" },
                "district": { "type": "keyword" },
                "business_area": { "type": "keyword" },
                "labels": { "type": "keyword" },
                "skills": { "type": "keyword" },
                "experience": { "type": "keyword" },
                "degree": { "type": "keyword" },
                "perks": { "type": "keyword" },
                "embedding": {
                    "type": "dense_vector",
                    "dims": EMBEDDING_DIMS,
                    "index": true,
                    "similarity": "cosine"
                }
            }
        }))
    }

    fn embedding_string(&self) -> String {
        let mut parts = vec![
            self.title.as_str(),
            self.salary.as_str(),
            self.company.as_str(),
            self.city.as_str(),
            self.experience.as_str(),
            self.degree.as_str(),
        ];
        parts.extend(self.skills.iter().map(String::as_str));
        parts.extend(self.labels.iter().map(String::as_str));
        parts.retain(|p| !p.is_empty());
        parts.join(" ")
    }

    fn set_embedding(&mut self, embedding: Vec<f32>) {
        self.embedding = Some(embedding);
    }

    fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }
}

#[derive(Debug, Deserialize)]
struct ListingEnvelope {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: ListingData,
}

#[derive(Debug, Default, Deserialize)]
struct ListingData {
    #[serde(default, rename = "hasMore")]
    _has_more: bool,
    #[serde(default)]
    list: Vec<JobListing>,
}

/// Decode a hijacked listing-feed body into raw records.
///
/// A non-zero envelope code is an API-level rejection and fails the whole
/// message; the consumer logs it and moves on.
pub fn decode_listing_payload(body: &[u8]) -> anyhow::Result<Vec<JobListing>> {
    let envelope: ListingEnvelope =
        serde_json::from_slice(body).context("listing payload is not valid JSON")?;
    if envelope.code != 0 {
        bail!(
            "listing API returned error {}: {}",
            envelope.code,
            envelope.message
        );
    }
    Ok(envelope.data.list)
}
