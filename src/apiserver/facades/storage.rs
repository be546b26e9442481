//! Storage facade.

use super::{accessible_unit, Entities, ErrorResults};
use crate::apiserver::envelope::WireError;
use crate::apiserver::facade::{
    decode_params, encode_result, no_such_request, CallContext, Facade, FacadeFuture,
};
use crate::core::error::{KeelError, KeelResult};
use crate::state::{StorageAttachment, StorageKind, Tag};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Names one attachment.
#[derive(Debug, Clone, Deserialize)]
struct AttachmentId {
    storage_tag: String,
    unit_tag: String,
}

#[derive(Debug, Default, Deserialize)]
struct AttachmentIds {
    #[serde(default)]
    ids: Vec<AttachmentId>,
}

#[derive(Debug, Deserialize)]
struct AddInstance {
    owner_tag: String,
    name: String,
    kind: String,
}

#[derive(Debug, Deserialize)]
struct Attach {
    storage_tag: String,
    unit_tag: String,
    #[serde(default)]
    location: String,
}

#[derive(Debug, Serialize)]
struct AttachmentsResult {
    attachments: Vec<StorageAttachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<WireError>,
}

#[derive(Debug, Serialize)]
struct AttachmentResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<StorageAttachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<WireError>,
}

fn storage_id(tag: &str) -> KeelResult<String> {
    match Tag::parse(tag)? {
        Tag::Storage(id) => Ok(id),
        other => Err(KeelError::invalid(format!("{} is not a storage tag", other))),
    }
}

/// Storage instances and their attachments to units.
#[derive(Debug, Default)]
pub struct StorageFacade;

impl StorageFacade {
    fn unit_storage_attachments(&self, ctx: &CallContext, params: Entities) -> Value {
        let results: Vec<AttachmentsResult> = params
            .entities
            .iter()
            .map(|entity| {
                let found = accessible_unit(ctx, &entity.tag)
                    .and_then(|unit| ctx.state.unit_storage_attachments(unit.name()));
                match found {
                    Ok(attachments) => AttachmentsResult {
                        attachments,
                        error: None,
                    },
                    Err(e) => AttachmentsResult {
                        attachments: Vec::new(),
                        error: Some(WireError::from(&e)),
                    },
                }
            })
            .collect();
        serde_json::json!({ "results": results })
    }

    /// Resolve an attachment id to `(storage id, unit name)`.
    fn resolve(&self, ctx: &CallContext, id: &AttachmentId) -> KeelResult<(String, String)> {
        let unit = accessible_unit(ctx, &id.unit_tag)?;
        Ok((storage_id(&id.storage_tag)?, unit.name().to_string()))
    }

    fn storage_attachments(&self, ctx: &CallContext, params: AttachmentIds) -> Value {
        let results: Vec<AttachmentResult> = params
            .ids
            .iter()
            .map(|id| {
                let found = self
                    .resolve(ctx, id)
                    .and_then(|(storage, unit)| ctx.state.storage_attachment(&storage, &unit));
                match found {
                    Ok(attachment) => AttachmentResult {
                        result: Some(attachment),
                        error: None,
                    },
                    Err(e) => AttachmentResult {
                        result: None,
                        error: Some(WireError::from(&e)),
                    },
                }
            })
            .collect();
        serde_json::json!({ "results": results })
    }

    fn each_attachment<F>(&self, ctx: &CallContext, params: AttachmentIds, op: F) -> ErrorResults
    where
        F: Fn(&str, &str) -> KeelResult<()>,
    {
        params
            .ids
            .iter()
            .map(|id| {
                let (storage, unit) = self.resolve(ctx, id)?;
                op(&storage, &unit)
            })
            .collect()
    }

    fn add_storage_instance(&self, ctx: &CallContext, params: AddInstance) -> KeelResult<Value> {
        ctx.require_user()?;
        let kind = StorageKind::parse(&params.kind)?;
        let instance = ctx
            .state
            .add_storage_instance(&params.owner_tag, &params.name, kind)?;
        Ok(serde_json::json!({ "storage_tag": instance.tag().to_string() }))
    }

    fn attach_storage(&self, ctx: &CallContext, params: Attach) -> KeelResult<Value> {
        ctx.require_user()?;
        let storage = storage_id(&params.storage_tag)?;
        let unit = match Tag::parse(&params.unit_tag)? {
            Tag::Unit(name) => name,
            other => return Err(KeelError::invalid(format!("{} is not a unit tag", other))),
        };
        let attachment = ctx.state.attach_storage(&storage, &unit, &params.location)?;
        encode_result(&attachment)
    }
}

impl Facade for StorageFacade {
    fn name(&self) -> &'static str {
        "Storage"
    }

    fn call<'a>(&'a self, ctx: &'a CallContext, request: &'a str, params: Value) -> FacadeFuture<'a> {
        Box::pin(async move {
            match request {
                "UnitStorageAttachments" => {
                    Ok(self.unit_storage_attachments(ctx, decode_params(params)?))
                }
                "StorageAttachments" => Ok(self.storage_attachments(ctx, decode_params(params)?)),
                "EnsureStorageAttachmentsDead" => {
                    let results = self.each_attachment(ctx, decode_params(params)?, |s, u| {
                        ctx.state.ensure_storage_attachment_dead(s, u)
                    });
                    encode_result(&results)
                }
                "RemoveStorageAttachments" => {
                    let results = self.each_attachment(ctx, decode_params(params)?, |s, u| {
                        ctx.state.remove_storage_attachment(s, u)
                    });
                    encode_result(&results)
                }
                "AddStorageInstance" => self.add_storage_instance(ctx, decode_params(params)?),
                "AttachStorage" => self.attach_storage(ctx, decode_params(params)?),
                other => Err(no_such_request(self.name(), other)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apiserver::facades::testing;
    use serde_json::json;

    #[tokio::test]
    async fn test_attachment_lifecycle() {
        let st = testing::state();
        let admin = testing::admin(&st);

        let added = StorageFacade
            .call(
                &admin,
                "AddStorageInstance",
                json!({"owner_tag": "unit-wordpress-0", "name": "data", "kind": "filesystem"}),
            )
            .await
            .unwrap();
        assert_eq!(added["storage_tag"], "storage-data-0");

        let attached = StorageFacade
            .call(
                &admin,
                "AttachStorage",
                json!({"storage_tag": "storage-data-0", "unit_tag": "unit-wordpress-0", "location": "/srv"}),
            )
            .await
            .unwrap();
        assert_eq!(attached["location"], "/srv");
        assert_eq!(attached["kind"], "filesystem");

        let unit = testing::unit(&st, "wordpress/0");
        let listed = StorageFacade
            .call(&unit, "UnitStorageAttachments", json!({"entities": [{"tag": "unit-wordpress-0"}]}))
            .await
            .unwrap();
        assert_eq!(listed["results"][0]["attachments"][0]["storage_tag"], "storage-data-0");

        let ids = json!({"ids": [{"storage_tag": "storage-data-0", "unit_tag": "unit-wordpress-0"}]});
        let removed = StorageFacade
            .call(&unit, "RemoveStorageAttachments", ids.clone())
            .await
            .unwrap();
        assert_eq!(removed["results"][0]["error"]["code"], "bad request");

        let dead = StorageFacade
            .call(&unit, "EnsureStorageAttachmentsDead", ids.clone())
            .await
            .unwrap();
        assert!(dead["results"][0].get("error").is_none());
        let removed = StorageFacade
            .call(&unit, "RemoveStorageAttachments", ids.clone())
            .await
            .unwrap();
        assert!(removed["results"][0].get("error").is_none());

        let gone = StorageFacade
            .call(&unit, "StorageAttachments", ids)
            .await
            .unwrap();
        assert_eq!(gone["results"][0]["error"]["code"], "not found");
    }

    #[tokio::test]
    async fn test_units_cannot_add_instances() {
        let st = testing::state();
        let unit = testing::unit(&st, "wordpress/0");
        let err = StorageFacade
            .call(
                &unit,
                "AddStorageInstance",
                json!({"owner_tag": "unit-wordpress-0", "name": "data", "kind": "block"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err, KeelError::PermissionDenied);
    }
}
