use sqlx::PgPool;

use super::store::StoreResult;

// Bootstrap DDL, applied at startup. The users / ssh_keys /
// user_host_accounts / managed_hosts tables belong to the portal
// subsystems; they are created here only so the engine can run standalone,
// and the engine treats them as read-only apart from the documented
// timestamp/status stamps.
const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
      id uuid PRIMARY KEY,
      username text UNIQUE NOT NULL,
      status text NOT NULL DEFAULT 'active',
      created_at timestamptz NOT NULL DEFAULT now()
    );

    CREATE TABLE IF NOT EXISTS managed_hosts (
      id uuid PRIMARY KEY,
      hostname text UNIQUE NOT NULL,
      address text NOT NULL,
      os_family text NOT NULL,
      last_seen_at timestamptz,
      created_at timestamptz NOT NULL DEFAULT now()
    );

    CREATE TABLE IF NOT EXISTS ssh_keys (
      id uuid PRIMARY KEY,
      user_id uuid NOT NULL REFERENCES users(id) ON DELETE CASCADE,
      public_key text NOT NULL,
      algorithm text NOT NULL,
      bit_length integer NOT NULL,
      comment text,
      fingerprint_sha256 text UNIQUE NOT NULL,
      authorized_keys_options text,
      status text NOT NULL DEFAULT 'active',
      expires_at timestamptz,
      last_applied_at timestamptz,
      created_at timestamptz NOT NULL DEFAULT now()
    );

    CREATE TABLE IF NOT EXISTS user_host_accounts (
      id uuid PRIMARY KEY,
      user_id uuid NOT NULL REFERENCES users(id) ON DELETE CASCADE,
      host_id uuid NOT NULL REFERENCES managed_hosts(id) ON DELETE CASCADE,
      remote_username text NOT NULL,
      status text NOT NULL DEFAULT 'active',
      created_at timestamptz NOT NULL DEFAULT now(),
      UNIQUE (user_id, host_id, remote_username)
    );

    CREATE TABLE IF NOT EXISTS apply_queue (
      id uuid PRIMARY KEY,
      user_host_account_id uuid NOT NULL REFERENCES user_host_accounts(id) ON DELETE CASCADE,
      priority smallint NOT NULL DEFAULT 0,
      status text NOT NULL DEFAULT 'queued',
      scheduled_at timestamptz NOT NULL DEFAULT now(),
      started_at timestamptz,
      finished_at timestamptz,
      retry_count integer NOT NULL DEFAULT 0,
      error text,
      created_at timestamptz NOT NULL DEFAULT now()
    );

    -- Coalescing: at most one pending row per account.
    CREATE UNIQUE INDEX IF NOT EXISTS apply_queue_one_queued_per_account
      ON apply_queue (user_host_account_id)
      WHERE status = 'queued';

    CREATE INDEX IF NOT EXISTS apply_queue_claim_order
      ON apply_queue (status, priority DESC, scheduled_at ASC);

    CREATE TABLE IF NOT EXISTS deployments (
      id uuid PRIMARY KEY,
      host_id uuid NOT NULL REFERENCES managed_hosts(id) ON DELETE CASCADE,
      user_host_account_id uuid NOT NULL REFERENCES user_host_accounts(id) ON DELETE CASCADE,
      generation bigint NOT NULL,
      status text NOT NULL DEFAULT 'pending',
      checksum text,
      key_count integer NOT NULL DEFAULT 0,
      started_at timestamptz NOT NULL DEFAULT now(),
      finished_at timestamptz,
      error text,
      retry_count integer NOT NULL DEFAULT 0,
      UNIQUE (host_id, user_host_account_id, generation)
    );

    CREATE INDEX IF NOT EXISTS deployments_by_account
      ON deployments (user_host_account_id, generation DESC);
"#;

pub async fn ensure_schema(db: &PgPool) -> StoreResult<()> {
    sqlx::raw_sql(SCHEMA_SQL).execute(db).await?;
    Ok(())
}
