use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::store::Store;

/// Sets the tenant-scoping session variable for the lifetime of the current
/// transaction, for the row-level-security policies that key off
/// `current_setting('app.tenant_id')` rather than an explicit
/// `WHERE tenant_id = $n` predicate. Most Store queries filter by
/// `tenant_id` directly and don't need this; `assign_step_run_to_worker`
/// calls it because its candidate-worker CTE runs under RLS.
pub async fn set_tenant_id_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &Uuid,
) -> anyhow::Result<()> {
    sqlx::query("SELECT set_config('app.tenant_id', $1::text, true)")
        .bind(tenant_id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn validate_tenant_id(pool: &PgPool, tenant_id: &Uuid) -> anyhow::Result<bool> {
    let exists =
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM tenants WHERE id = $1)")
            .bind(tenant_id)
            .fetch_one(pool)
            .await?;
    Ok(exists)
}

impl Store {
    pub async fn validate_tenant_id(&self, tenant_id: &Uuid) -> anyhow::Result<bool> {
        validate_tenant_id(&self.pool, tenant_id).await
    }

    /// All known tenant ids, used by the process shell to seed one
    /// requeue-sweep task per tenant at startup (§4.3 runs "per tenant").
    pub async fn list_tenant_ids(&self) -> anyhow::Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM tenants").fetch_all(&self.pool).await?;
        Ok(ids)
    }
}
