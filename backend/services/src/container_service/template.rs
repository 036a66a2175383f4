use fleetwarden_shared::rpc::{ListTemplateReply, PageRequest, TemplateRequest};
use fleetwarden_shared::{ContainerConfigs, ContainerTemplate};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, Set};

use super::ContainerService;
use crate::database::unix_now;
use crate::entity::container_templates;
use crate::error::{ServiceError, ServiceResult};
use crate::pagination::fetch_page;
use crate::validation::{is_valid_container_name, is_valid_desc};

impl ContainerService {
    pub async fn list_templates(&self, req: &PageRequest) -> ServiceResult<ListTemplateReply> {
        let select = container_templates::Entity::find().order_by_asc(container_templates::Column::Id);
        let (pager, rows) = fetch_page(&self.db, select, req.page_size, req.page_no).await?;
        Ok(ListTemplateReply {
            page: pager.info(),
            data: rows.into_iter().filter_map(to_template).collect(),
        })
    }

    pub async fn create_template(&self, req: &TemplateRequest) -> ServiceResult<i64> {
        validate_template(req)?;
        let now = unix_now();
        let row = container_templates::ActiveModel {
            node_id: Set(req.node_id),
            name: Set(req.conf.name.clone()),
            config_json: Set(serde_json::to_string(&req.conf)?),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;
        log::info!("template {} created id={}", row.name, row.id);
        Ok(row.id)
    }

    pub async fn update_template(&self, req: &TemplateRequest) -> ServiceResult<()> {
        validate_template(req)?;
        if req.id <= 0 {
            return Err(ServiceError::invalid("template id"));
        }

        let row = self.find_template(req.id).await?;
        let mut active = row.into_active_model();
        active.node_id = Set(req.node_id);
        active.name = Set(req.conf.name.clone());
        active.config_json = Set(serde_json::to_string(&req.conf)?);
        active.updated_at = Set(unix_now());
        active.update(&self.db).await?;
        Ok(())
    }

    pub async fn remove_templates(&self, ids: &[i64]) -> ServiceResult<()> {
        if ids.is_empty() {
            return Err(ServiceError::invalid("empty template id list"));
        }
        container_templates::Entity::delete_many()
            .filter(container_templates::Column::Id.is_in(ids.to_vec()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn inspect_template(&self, id: i64) -> ServiceResult<ContainerTemplate> {
        if id <= 0 {
            return Err(ServiceError::invalid("template id"));
        }
        let row = self.find_template(id).await?;
        let conf: ContainerConfigs = serde_json::from_str(&row.config_json).map_err(|e| {
            log::warn!("template {} holds unreadable json: {}", row.id, e);
            ServiceError::internal("template is corrupted")
        })?;
        Ok(ContainerTemplate {
            id: row.id,
            node_id: row.node_id,
            conf,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    async fn find_template(&self, id: i64) -> ServiceResult<container_templates::Model> {
        container_templates::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("template {}", id)))
    }
}

fn validate_template(req: &TemplateRequest) -> ServiceResult<()> {
    if req.node_id <= 0 {
        Err(ServiceError::invalid("node id"))
    } else if !is_valid_container_name(&req.conf.name) {
        Err(ServiceError::invalid("template name"))
    } else if !is_valid_desc(&req.conf.desc) {
        Err(ServiceError::invalid("template description"))
    } else {
        Ok(())
    }
}

fn to_template(row: container_templates::Model) -> Option<ContainerTemplate> {
    match serde_json::from_str(&row.config_json) {
        Ok(conf) => Some(ContainerTemplate {
            id: row.id,
            node_id: row.node_id,
            conf,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }),
        Err(e) => {
            log::warn!("skip template {}: {}", row.id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::fixture;
    use super::*;
    use crate::testing::FakeConnector;
    use fleetwarden_shared::ErrorKind;
    use std::sync::Arc;

    fn template(name: &str) -> TemplateRequest {
        TemplateRequest {
            id: 0,
            node_id: 1,
            conf: ContainerConfigs {
                name: name.into(),
                image: "nginx:1.25".into(),
                desc: "front".into(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn template_crud() {
        let fx = fixture(Arc::new(FakeConnector::default()), &[]).await;
        let svc = &fx.service;

        let id = svc.create_template(&template("web")).await.unwrap();
        let err = svc.create_template(&template("web")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let mut req = template("web-v2");
        req.id = id;
        svc.update_template(&req).await.unwrap();
        let t = svc.inspect_template(id).await.unwrap();
        assert_eq!(t.conf.name, "web-v2");
        assert_eq!(t.conf.desc, "front");

        for i in 0..12 {
            svc.create_template(&template(&format!("t{}", i))).await.unwrap();
        }
        let page = svc
            .list_templates(&PageRequest {
                page_size: 10,
                page_no: 9,
            })
            .await
            .unwrap();
        assert_eq!(page.page.page_no, 2);
        assert_eq!(page.page.total_pages, 2);
        assert_eq!(page.data.len(), 3);

        svc.remove_templates(&[id]).await.unwrap();
        let err = svc.inspect_template(id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn template_names_are_validated() {
        let fx = fixture(Arc::new(FakeConnector::default()), &[]).await;
        let err = fx.service.create_template(&template("-bad")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
