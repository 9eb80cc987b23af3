use async_trait::async_trait;
use chrono::{ DateTime, Utc };
use log::{ error, info };
use redis::{ pipe, AsyncCommands, Client, Script };
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{ ChatError, ChatResult };
use crate::history::ChatStore;
use crate::models::chat::{ Conversation, Message, NewMessage };

// KEYS: conversation hash, thread list, message key.
// ARGV: message id, message json, updated_at, score, user index prefix, conversation id.
const INSERT_MESSAGE: &str =
    r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('SET', KEYS[3], ARGV[2])
redis.call('RPUSH', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[1], 'updated_at', ARGV[3])
local user_id = redis.call('HGET', KEYS[1], 'user_id')
redis.call('ZADD', ARGV[5] .. user_id .. ':conversations', ARGV[4], ARGV[6])
return 1
"#;

// KEYS: conversation hash. ARGV: title.
const RENAME_CONVERSATION: &str =
    r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('HSET', KEYS[1], 'title', ARGV[1])
return 1
"#;

// KEYS: conversation hash, thread list.
// ARGV: message key prefix, user index prefix, conversation id.
const DELETE_CONVERSATION: &str =
    r#"
local user_id = redis.call('HGET', KEYS[1], 'user_id')
if not user_id then return 0 end
for _, id in ipairs(redis.call('LRANGE', KEYS[2], 0, -1)) do
  redis.call('DEL', ARGV[1] .. id)
end
redis.call('DEL', KEYS[2], KEYS[1])
redis.call('ZREM', ARGV[2] .. user_id .. ':conversations', ARGV[3])
return 1
"#;

/// Key layout under the configured prefix.
#[derive(Clone, Debug)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn conversation(&self, id: &str) -> String {
        format!("{}conversation:{}", self.prefix, id)
    }

    fn user_prefix(&self) -> String {
        format!("{}user:", self.prefix)
    }

    fn user_index(&self, user_id: &str) -> String {
        format!("{}{}:conversations", self.user_prefix(), user_id)
    }

    fn thread(&self, conversation_id: &str) -> String {
        format!("{}messages:{}", self.prefix, conversation_id)
    }

    fn message_prefix(&self) -> String {
        format!("{}message:", self.prefix)
    }

    fn message(&self, id: &str) -> String {
        format!("{}{}", self.message_prefix(), id)
    }
}

/// `LRANGE` bounds for a page, or `None` when the page lies past any list Redis can hold.
fn lrange_bounds(offset: usize, limit: usize) -> Option<(isize, isize)> {
    if limit == 0 {
        return None;
    }
    let start = isize::try_from(offset).ok()?;
    let last = offset.checked_add(limit - 1)?;
    let stop = isize::try_from(last).unwrap_or(isize::MAX);
    Some((start, stop))
}

fn conversation_fields(conversation: &Conversation) -> Vec<(&'static str, String)> {
    vec![
        ("id", conversation.id.clone()),
        ("user_id", conversation.user_id.clone()),
        ("title", conversation.title.clone()),
        ("created_at", conversation.created_at.to_rfc3339()),
        ("updated_at", conversation.updated_at.to_rfc3339())
    ]
}

fn conversation_from_fields(mut fields: HashMap<String, String>) -> ChatResult<Option<Conversation>> {
    if fields.is_empty() {
        return Ok(None);
    }
    let mut take = |name: &str| {
        fields
            .remove(name)
            .ok_or_else(|| ChatError::Storage(format!("conversation record is missing '{}'", name)))
    };
    let id = take("id")?;
    let user_id = take("user_id")?;
    let title = take("title")?;
    let created_at = parse_time(&take("created_at")?)?;
    let updated_at = parse_time(&take("updated_at")?)?;
    Ok(Some(Conversation { id, user_id, title, created_at, updated_at }))
}

fn parse_time(value: &str) -> ChatResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ChatError::Storage(format!("bad timestamp '{}': {}", value, e)))
}

/// Conversations are hashes at `conversation:<id>` so field updates never
/// overwrite each other; `user:<uid>:conversations` is a zset scored by
/// updated_at millis; `messages:<cid>` lists message ids and `message:<id>`
/// holds the message JSON. Multi-key updates run as Lua scripts.
pub struct RedisStore {
    conn: MultiplexedConnection,
    keys: Keys,
    insert_script: Script,
    rename_script: Script,
    delete_script: Script,
}

impl RedisStore {
    pub async fn connect(url: &str, key_prefix: &str) -> ChatResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis history store at {}", url);
        Ok(Self {
            conn,
            keys: Keys { prefix: key_prefix.to_string() },
            insert_script: Script::new(INSERT_MESSAGE),
            rename_script: Script::new(RENAME_CONVERSATION),
            delete_script: Script::new(DELETE_CONVERSATION),
        })
    }

    async fn load_messages(&self, ids: Vec<String>) -> ChatResult<Vec<Message>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let keys: Vec<String> = ids
            .iter()
            .map(|id| self.keys.message(id))
            .collect();
        let entries: Vec<Option<String>> = conn.mget(keys).await?;
        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries.into_iter().flatten() {
            match serde_json::from_str::<Message>(&entry) {
                Ok(msg) => messages.push(msg),
                Err(e) => error!("Error parsing history entry: {}", e),
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl ChatStore for RedisStore {
    async fn create_conversation(&self, user_id: &str, title: &str) -> ChatResult<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };
        let mut conn = self.conn.clone();
        let _: () = pipe()
            .atomic()
            .hset_multiple(self.keys.conversation(&conversation.id), conversation_fields(&conversation).as_slice())
            .ignore()
            .zadd(self.keys.user_index(user_id), &conversation.id, now.timestamp_millis())
            .ignore()
            .query_async(&mut conn).await?;
        Ok(conversation)
    }

    async fn list_conversations(&self, user_id: &str) -> ChatResult<Vec<Conversation>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrevrange(self.keys.user_index(user_id), 0, -1).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut batch = pipe();
        for id in &ids {
            batch.hgetall(self.keys.conversation(id));
        }
        let records: Vec<HashMap<String, String>> = batch.query_async(&mut conn).await?;
        let mut list = Vec::new();
        for record in records {
            match conversation_from_fields(record) {
                Ok(Some(c)) => list.push(c),
                Ok(None) => {}
                Err(e) => error!("Error parsing conversation entry: {}", e),
            }
        }
        Ok(list)
    }

    async fn get_conversation(&self, conversation_id: &str) -> ChatResult<Option<Conversation>> {
        let mut conn = self.conn.clone();
        let record: HashMap<String, String> = conn.hgetall(self.keys.conversation(conversation_id)).await?;
        conversation_from_fields(record)
    }

    async fn rename_conversation(&self, conversation_id: &str, title: &str) -> ChatResult<Conversation> {
        let mut conn = self.conn.clone();
        let renamed: i64 = self.rename_script
            .key(self.keys.conversation(conversation_id))
            .arg(title)
            .invoke_async(&mut conn).await?;
        if renamed == 0 {
            return Err(ChatError::NotFound(format!("conversation {}", conversation_id)));
        }
        self.get_conversation(conversation_id).await?.ok_or_else(||
            ChatError::NotFound(format!("conversation {}", conversation_id))
        )
    }

    async fn delete_conversation(&self, conversation_id: &str) -> ChatResult<()> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self.delete_script
            .key(self.keys.conversation(conversation_id))
            .key(self.keys.thread(conversation_id))
            .arg(self.keys.message_prefix())
            .arg(self.keys.user_prefix())
            .arg(conversation_id)
            .invoke_async(&mut conn).await?;
        if deleted == 0 {
            return Err(ChatError::NotFound(format!("conversation {}", conversation_id)));
        }
        Ok(())
    }

    async fn insert_message(&self, message: NewMessage) -> ChatResult<Message> {
        let now = Utc::now();
        let stored = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: message.conversation_id,
            role: message.role,
            content: message.content,
            created_at: now,
        };
        let mut conn = self.conn.clone();
        let inserted: i64 = self.insert_script
            .key(self.keys.conversation(&stored.conversation_id))
            .key(self.keys.thread(&stored.conversation_id))
            .key(self.keys.message(&stored.id))
            .arg(&stored.id)
            .arg(serde_json::to_string(&stored)?)
            .arg(now.to_rfc3339())
            .arg(now.timestamp_millis())
            .arg(self.keys.user_prefix())
            .arg(&stored.conversation_id)
            .invoke_async(&mut conn).await?;
        if inserted == 0 {
            return Err(ChatError::NotFound(format!("conversation {}", stored.conversation_id)));
        }
        Ok(stored)
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        offset: usize,
        limit: usize
    ) -> ChatResult<Vec<Message>> {
        let (start, stop) = match lrange_bounds(offset, limit) {
            Some(bounds) => bounds,
            None => {
                return Ok(Vec::new());
            }
        };
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.lrange(self.keys.thread(conversation_id), start, stop).await?;
        self.load_messages(ids).await
    }

    async fn recent_messages(&self, conversation_id: &str, n: usize) -> ChatResult<Vec<Message>> {
        let count = match isize::try_from(n) {
            Ok(0) => {
                return Ok(Vec::new());
            }
            Ok(count) => count,
            Err(_) => isize::MAX,
        };
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.lrange(self.keys.thread(conversation_id), -count, -1).await?;
        self.load_messages(ids).await
    }

    async fn get_message(&self, message_id: &str) -> ChatResult<Option<Message>> {
        let mut conn = self.conn.clone();
        let entry: Option<String> = conn.get(self.keys.message(message_id)).await?;
        Ok(entry.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    async fn delete_message(&self, message_id: &str) -> ChatResult<()> {
        let message = self
            .get_message(message_id).await?
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
        let mut conn = self.conn.clone();
        let _: () = pipe()
            .atomic()
            .lrem(self.keys.thread(&message.conversation_id), 0, message_id)
            .ignore()
            .del(self.keys.message(message_id))
            .ignore()
            .query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_bounds_are_inclusive() {
        assert_eq!(lrange_bounds(0, 20), Some((0, 19)));
        assert_eq!(lrange_bounds(40, 1), Some((40, 40)));
        assert_eq!(lrange_bounds(3, 0), None);
    }

    #[test]
    fn huge_offsets_give_an_empty_page() {
        assert_eq!(lrange_bounds(usize::MAX, 20), None);
        assert_eq!(lrange_bounds(isize::MAX as usize + 1, 1), None);
        // The stop index saturates instead of wrapping negative.
        assert_eq!(lrange_bounds(isize::MAX as usize, 20), Some((isize::MAX, isize::MAX)));
        assert_eq!(lrange_bounds(5, usize::MAX - 4), Some((5, isize::MAX)));
    }

    #[test]
    fn keys_share_the_prefix() {
        let keys = Keys { prefix: "chat:".to_string() };
        assert_eq!(keys.conversation("c1"), "chat:conversation:c1");
        assert_eq!(keys.user_index("u1"), "chat:user:u1:conversations");
        assert_eq!(keys.thread("c1"), "chat:messages:c1");
        assert_eq!(keys.message("m1"), "chat:message:m1");
        assert!(keys.user_index("u1").starts_with(&keys.user_prefix()));
    }

    #[test]
    fn conversation_hash_fields_round_trip() {
        let now = Utc::now();
        let conversation = Conversation {
            id: "c1".into(),
            user_id: "u1".into(),
            title: "Budget".into(),
            created_at: now,
            updated_at: now,
        };
        let fields: HashMap<String, String> = conversation_fields(&conversation)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let back = conversation_from_fields(fields).unwrap().unwrap();
        assert_eq!(back.title, "Budget");
        assert_eq!(back.updated_at.timestamp_millis(), now.timestamp_millis());

        assert!(conversation_from_fields(HashMap::new()).unwrap().is_none());
        let partial = HashMap::from([("title".to_string(), "only".to_string())]);
        assert!(matches!(conversation_from_fields(partial), Err(ChatError::Storage(_))));
    }
}
