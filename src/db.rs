use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, Params, Row, Transaction};

use crate::auth::{hash_password, verify_password};
use crate::error::AppError;
use crate::models::{normalize_email, AuthToken, ObjectId, Todo, TodoChanges, User};

pub type DbPool = Arc<Mutex<Connection>>;

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        email TEXT UNIQUE NOT NULL,
        password TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS user_tokens (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        access TEXT NOT NULL,
        token TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS user_tokens_user_id ON user_tokens(user_id);

    CREATE TABLE IF NOT EXISTS todos (
        id TEXT PRIMARY KEY,
        text TEXT NOT NULL,
        completed INTEGER NOT NULL DEFAULT 0,
        completed_at INTEGER,
        creator TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS todos_creator ON todos(creator);
";

const TODO_COLUMNS: &str = "id, text, completed, completed_at, creator";

pub fn init_db(path: impl AsRef<Path>) -> Result<DbPool, AppError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;
    Ok(Arc::new(Mutex::new(conn)))
}

pub fn init_db_in_memory() -> Result<DbPool, AppError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn lock(pool: &DbPool) -> Result<MutexGuard<'_, Connection>, AppError> {
    pool.lock()
        .map_err(|_| AppError::Store("database connection lock poisoned".to_string()))
}

// User operations

/// Hashes the plaintext password only when one is pending.
fn hash_pending_password(user: &mut User) -> Result<(), AppError> {
    if let Some(plain) = user.take_pending_password() {
        user.password_hash = hash_password(&plain)?;
    }
    Ok(())
}

pub fn insert_user(pool: &DbPool, user: &mut User) -> Result<(), AppError> {
    user.validate()?;
    hash_pending_password(user)?;

    let mut conn = lock(pool)?;
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO users (id, email, password) VALUES (?1, ?2, ?3)",
        (&user.id, &user.email, &user.password_hash),
    )?;
    write_tokens(&tx, user)?;
    tx.commit()?;
    Ok(())
}

/// Persists email and password. The token list is only changed through
/// `push_token` and `remove_token`.
pub fn save_user(pool: &DbPool, user: &mut User) -> Result<(), AppError> {
    user.validate()?;
    hash_pending_password(user)?;

    let conn = lock(pool)?;
    let rows = conn.execute(
        "UPDATE users SET email = ?2, password = ?3 WHERE id = ?1",
        (&user.id, &user.email, &user.password_hash),
    )?;
    if rows == 0 {
        return Err(AppError::Store(format!("user {} no longer exists", user.id)));
    }
    Ok(())
}

/// Appends one token to the stored list, leaving every other entry alone.
pub fn push_token(
    pool: &DbPool,
    user_id: &ObjectId,
    access: &str,
    token: &str,
) -> Result<(), AppError> {
    let conn = lock(pool)?;
    conn.execute(
        "INSERT INTO user_tokens (user_id, access, token) VALUES (?1, ?2, ?3)",
        (user_id, access, token),
    )?;
    Ok(())
}

/// Deletes every stored entry carrying `token`, returning how many went.
pub fn remove_token(pool: &DbPool, user_id: &ObjectId, token: &str) -> Result<usize, AppError> {
    let conn = lock(pool)?;
    let rows = conn.execute(
        "DELETE FROM user_tokens WHERE user_id = ?1 AND token = ?2",
        (user_id, token),
    )?;
    Ok(rows)
}

fn write_tokens(tx: &Transaction<'_>, user: &User) -> rusqlite::Result<()> {
    let mut stmt =
        tx.prepare("INSERT INTO user_tokens (user_id, access, token) VALUES (?1, ?2, ?3)")?;
    for token in &user.tokens {
        stmt.execute((&user.id, &token.access, &token.token))?;
    }
    Ok(())
}

fn load_tokens(conn: &Connection, user_id: &ObjectId) -> rusqlite::Result<Vec<AuthToken>> {
    let mut stmt =
        conn.prepare("SELECT access, token FROM user_tokens WHERE user_id = ?1 ORDER BY seq")?;
    let tokens = stmt
        .query_map([user_id], |row| {
            Ok(AuthToken {
                access: row.get(0)?,
                token: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tokens)
}

fn find_user_where<P: Params>(
    conn: &Connection,
    clause: &str,
    params: P,
) -> rusqlite::Result<Option<User>> {
    let sql = format!("SELECT id, email, password FROM users WHERE {clause}");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params)?;

    if let Some(row) = rows.next()? {
        let id: ObjectId = row.get(0)?;
        let tokens = load_tokens(conn, &id)?;
        Ok(Some(User::from_store(id, row.get(1)?, row.get(2)?, tokens)))
    } else {
        Ok(None)
    }
}

pub fn find_user_by_id(pool: &DbPool, id: &ObjectId) -> Result<Option<User>, AppError> {
    let conn = lock(pool)?;
    Ok(find_user_where(&conn, "id = ?1", [id])?)
}

/// Finds the user only if `token` is still in its list with `access`.
pub fn find_user_by_token(
    pool: &DbPool,
    id: &ObjectId,
    access: &str,
    token: &str,
) -> Result<Option<User>, AppError> {
    let conn = lock(pool)?;
    let user = find_user_where(
        &conn,
        "id = ?1 AND EXISTS (
            SELECT 1 FROM user_tokens t
            WHERE t.user_id = users.id AND t.token = ?2 AND t.access = ?3
        )",
        (id, token, access),
    )?;
    Ok(user)
}

pub fn find_user_by_credentials(
    pool: &DbPool,
    email: &str,
    password: &str,
) -> Result<User, AppError> {
    let user = {
        let conn = lock(pool)?;
        find_user_where(&conn, "email = ?1", [normalize_email(email)])?
    }
    .ok_or(AppError::AuthenticationFailed)?;

    if verify_password(password, &user.password_hash) {
        Ok(user)
    } else {
        Err(AppError::AuthenticationFailed)
    }
}

// Todo operations

fn todo_from_row(row: &Row<'_>) -> rusqlite::Result<Todo> {
    Ok(Todo {
        id: row.get(0)?,
        text: row.get(1)?,
        completed: row.get(2)?,
        completed_at: row.get(3)?,
        creator: row.get(4)?,
    })
}

pub fn create_todo(pool: &DbPool, todo: &Todo) -> Result<(), AppError> {
    todo.validate()?;
    let conn = lock(pool)?;
    conn.execute(
        "INSERT INTO todos (id, text, completed, completed_at, creator)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        (
            &todo.id,
            &todo.text,
            todo.completed,
            todo.completed_at,
            &todo.creator,
        ),
    )?;
    Ok(())
}

pub fn list_todos(pool: &DbPool, creator: &ObjectId) -> Result<Vec<Todo>, AppError> {
    let conn = lock(pool)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {TODO_COLUMNS} FROM todos WHERE creator = ?1 ORDER BY rowid ASC"
    ))?;
    let todos = stmt
        .query_map([creator], todo_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(todos)
}

pub fn get_todo(
    pool: &DbPool,
    id: &ObjectId,
    creator: &ObjectId,
) -> Result<Option<Todo>, AppError> {
    let conn = lock(pool)?;
    let todo = conn
        .query_row(
            &format!("SELECT {TODO_COLUMNS} FROM todos WHERE id = ?1 AND creator = ?2"),
            [id, creator],
            todo_from_row,
        )
        .optional()?;
    Ok(todo)
}

/// Removes the item and returns its state before removal.
pub fn delete_todo(
    pool: &DbPool,
    id: &ObjectId,
    creator: &ObjectId,
) -> Result<Option<Todo>, AppError> {
    let conn = lock(pool)?;
    let todo = conn
        .query_row(
            &format!("DELETE FROM todos WHERE id = ?1 AND creator = ?2 RETURNING {TODO_COLUMNS}"),
            [id, creator],
            todo_from_row,
        )
        .optional()?;
    Ok(todo)
}

/// Applies `changes` and returns the item as it is after the update.
pub fn update_todo(
    pool: &DbPool,
    id: &ObjectId,
    creator: &ObjectId,
    changes: &TodoChanges,
) -> Result<Option<Todo>, AppError> {
    let conn = lock(pool)?;
    let todo = conn
        .query_row(
            &format!(
                "UPDATE todos
                 SET text = COALESCE(?3, text), completed = ?4, completed_at = ?5
                 WHERE id = ?1 AND creator = ?2
                 RETURNING {TODO_COLUMNS}"
            ),
            (
                id,
                creator,
                changes.text.as_deref(),
                changes.completed,
                changes.completed_at,
            ),
            todo_from_row,
        )
        .optional()?;
    Ok(todo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AUTH_ACCESS;

    fn registered(pool: &DbPool, email: &str) -> User {
        let mut user = User::new(email, "password1");
        insert_user(pool, &mut user).unwrap();
        user
    }

    #[test]
    fn insert_hashes_password_once() {
        let pool = init_db_in_memory().unwrap();
        let mut user = registered(&pool, "a@example.com");
        assert!(!user.password_changed());
        assert!(user.password_hash.starts_with("$argon2"));

        let hash = user.password_hash.clone();
        user.email = "renamed@example.com".to_string();
        save_user(&pool, &mut user).unwrap();

        let stored = find_user_by_id(&pool, &user.id).unwrap().unwrap();
        assert_eq!(stored.password_hash, hash);
        assert_eq!(stored.email, "renamed@example.com");
    }

    #[test]
    fn changing_password_rehashes() {
        let pool = init_db_in_memory().unwrap();
        let mut user = registered(&pool, "a@example.com");
        let old_hash = user.password_hash.clone();

        user.set_password("another-secret");
        save_user(&pool, &mut user).unwrap();
        assert_ne!(user.password_hash, old_hash);

        assert!(find_user_by_credentials(&pool, "a@example.com", "another-secret").is_ok());
        assert!(matches!(
            find_user_by_credentials(&pool, "a@example.com", "password1"),
            Err(AppError::AuthenticationFailed)
        ));
    }

    #[test]
    fn credentials_lookup() {
        let pool = init_db_in_memory().unwrap();
        let user = registered(&pool, "Mixed@Example.com");

        let found = find_user_by_credentials(&pool, " MIXED@example.com", "password1").unwrap();
        assert_eq!(found.id, user.id);

        assert!(matches!(
            find_user_by_credentials(&pool, "nobody@example.com", "password1"),
            Err(AppError::AuthenticationFailed)
        ));
    }

    #[test]
    fn duplicate_email_is_reported() {
        let pool = init_db_in_memory().unwrap();
        registered(&pool, "a@example.com");

        let mut dup = User::new("A@example.com", "password2");
        let err = insert_user(&pool, &mut dup).unwrap_err();
        assert!(matches!(err, AppError::DuplicateEmail { .. }));
    }

    #[test]
    fn invalid_user_is_not_stored() {
        let pool = init_db_in_memory().unwrap();
        let mut user = User::new("bad", "1");
        assert!(matches!(
            insert_user(&pool, &mut user),
            Err(AppError::Validation(_))
        ));
        let count: i64 = pool
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn token_lookup_requires_live_token() {
        let pool = init_db_in_memory().unwrap();
        let user = registered(&pool, "a@example.com");
        push_token(&pool, &user.id, AUTH_ACCESS, "live").unwrap();
        push_token(&pool, &user.id, "reset", "other-purpose").unwrap();

        assert!(find_user_by_token(&pool, &user.id, AUTH_ACCESS, "live")
            .unwrap()
            .is_some());
        assert!(find_user_by_token(&pool, &user.id, AUTH_ACCESS, "other-purpose")
            .unwrap()
            .is_none());
        assert!(find_user_by_token(&pool, &ObjectId::generate(), AUTH_ACCESS, "live")
            .unwrap()
            .is_none());

        assert_eq!(remove_token(&pool, &user.id, "live").unwrap(), 1);
        assert!(find_user_by_token(&pool, &user.id, AUTH_ACCESS, "live")
            .unwrap()
            .is_none());
    }

    #[test]
    fn saving_user_keeps_tokens_written_elsewhere() {
        let pool = init_db_in_memory().unwrap();
        let mut stale = registered(&pool, "a@example.com");
        push_token(&pool, &stale.id, AUTH_ACCESS, "issued-meanwhile").unwrap();

        stale.set_password("brand-new-pass");
        save_user(&pool, &mut stale).unwrap();

        let stored = find_user_by_id(&pool, &stale.id).unwrap().unwrap();
        assert_eq!(stored.tokens.len(), 1);
        assert_eq!(stored.tokens[0].token, "issued-meanwhile");
    }

    #[test]
    fn remove_token_leaves_other_entries() {
        let pool = init_db_in_memory().unwrap();
        let user = registered(&pool, "a@example.com");
        push_token(&pool, &user.id, AUTH_ACCESS, "one").unwrap();
        push_token(&pool, &user.id, AUTH_ACCESS, "two").unwrap();
        push_token(&pool, &user.id, AUTH_ACCESS, "one").unwrap();

        assert_eq!(remove_token(&pool, &user.id, "one").unwrap(), 2);
        assert_eq!(remove_token(&pool, &ObjectId::generate(), "two").unwrap(), 0);

        let stored = find_user_by_id(&pool, &user.id).unwrap().unwrap();
        assert_eq!(stored.tokens.len(), 1);
        assert_eq!(stored.tokens[0].token, "two");
    }

    #[test]
    fn todos_are_scoped_to_their_creator() {
        let pool = init_db_in_memory().unwrap();
        let alice = ObjectId::generate();
        let bob = ObjectId::generate();

        let todo = Todo::new("alice's", alice);
        create_todo(&pool, &todo).unwrap();
        create_todo(&pool, &Todo::new("bob's", bob)).unwrap();

        let listed = list_todos(&pool, &alice).unwrap();
        assert_eq!(listed, vec![todo.clone()]);

        assert_eq!(get_todo(&pool, &todo.id, &alice).unwrap(), Some(todo.clone()));
        assert_eq!(get_todo(&pool, &todo.id, &bob).unwrap(), None);

        let changes = TodoChanges {
            text: Some("hijacked".into()),
            completed: true,
            completed_at: Some(1),
        };
        assert_eq!(update_todo(&pool, &todo.id, &bob, &changes).unwrap(), None);
        assert_eq!(delete_todo(&pool, &todo.id, &bob).unwrap(), None);
        assert_eq!(list_todos(&pool, &alice).unwrap().len(), 1);
    }

    #[test]
    fn update_and_delete_return_expected_state() {
        let pool = init_db_in_memory().unwrap();
        let owner = ObjectId::generate();
        let todo = Todo::new("write report", owner);
        create_todo(&pool, &todo).unwrap();

        let done = update_todo(
            &pool,
            &todo.id,
            &owner,
            &TodoChanges {
                text: None,
                completed: true,
                completed_at: Some(1_700_000_000_000),
            },
        )
        .unwrap()
        .unwrap();
        assert_eq!(done.text, "write report");
        assert!(done.completed);
        assert_eq!(done.completed_at, Some(1_700_000_000_000));

        let deleted = delete_todo(&pool, &todo.id, &owner).unwrap().unwrap();
        assert_eq!(deleted, done);
        assert_eq!(get_todo(&pool, &todo.id, &owner).unwrap(), None);
    }

    #[test]
    fn empty_text_is_rejected() {
        let pool = init_db_in_memory().unwrap();
        let err = create_todo(&pool, &Todo::new("  ", ObjectId::generate())).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn on_disk_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("todos.db");
        let owner = ObjectId::generate();

        {
            let pool = init_db(&path).unwrap();
            create_todo(&pool, &Todo::new("persist me", owner)).unwrap();
        }

        let pool = init_db(&path).unwrap();
        let todos = list_todos(&pool, &owner).unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].text, "persist me");
    }
}
