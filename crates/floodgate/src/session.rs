// A Session serves one connection: it parses request frames, routes
// commands to the collection layer, and encodes replies. Commands on a
// connection are processed in arrival order and replies keep that order.

use crate::{aggregate, error_reply, App, CommandError, FindOptions};
use bson::{doc, Document, Value};
use std::sync::Arc;
use wire::{Message, OpMsg, OpReply};

pub struct Session {
    app: Arc<App>,
    connection_id: u64,
    next_request_id: i32,
}

impl Session {
    pub fn new(app: Arc<App>) -> Self {
        let connection_id = app.next_connection_id();
        Self {
            app,
            connection_id,
            next_request_id: 1,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Closing the connection closes every cursor it owns.
    pub fn close(&self) {
        self.app.cursors.close_connection(self.connection_id);
    }

    fn reply_id(&mut self) -> i32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    /// Handle one complete frame, appending any reply bytes to `out`.
    /// A returned error is a protocol failure: the caller sends nothing
    /// further and closes the connection.
    #[tracing::instrument(level = "debug", skip_all, fields(connection = self.connection_id))]
    pub fn handle_frame(&mut self, frame: &[u8], out: &mut Vec<u8>) -> anyhow::Result<()> {
        let (header, message) = match Message::parse(frame) {
            Ok(parsed) => parsed,
            Err(err) => {
                // Best-effort error reply before the connection dies.
                let reply = error_reply(&anyhow::Error::new(err));
                let reply_id = self.reply_id();
                if let Ok(bytes) = OpMsg::single(reply).encode(reply_id, 0) {
                    out.extend_from_slice(&bytes);
                }
                anyhow::bail!("malformed frame; closing connection");
            }
        };

        match message {
            Message::Msg(msg) => {
                let fire_and_forget = msg.flags & wire::FLAG_MORE_TO_COME != 0;
                let body = msg.command_body()?;
                let reply = self.run_command(body);
                if !fire_and_forget {
                    let reply_id = self.reply_id();
                    out.extend_from_slice(&OpMsg::single(reply).encode(reply_id, header.request_id)?);
                }
            }
            Message::Query(query) => {
                let reply = self.handle_op_query(&query);
                let reply_id = self.reply_id();
                out.extend_from_slice(&reply.encode(reply_id, header.request_id)?);
            }
            Message::GetMore(get_more) => {
                let reply = self.handle_op_get_more(&get_more);
                let reply_id = self.reply_id();
                out.extend_from_slice(&reply.encode(reply_id, header.request_id)?);
            }
            Message::KillCursors(kill) => {
                let ids: Vec<u64> = kill.cursor_ids.iter().map(|id| *id as u64).collect();
                self.app.cursors.kill(&ids);
            }
            Message::Insert(insert) => {
                if let Some((db, coll)) = insert.full_collection_name.split_once('.') {
                    let _ = self
                        .app
                        .collections
                        .collection(db, coll)
                        .insert(insert.documents);
                }
            }
            Message::Update(update) => {
                if let Some((db, coll)) = update.full_collection_name.split_once('.') {
                    let _ = self.app.collections.collection(db, coll).update(
                        &update.selector,
                        &update.update,
                        update.is_multi(),
                        update.is_upsert(),
                    );
                }
            }
            Message::Delete(delete) => {
                if let Some((db, coll)) = delete.full_collection_name.split_once('.') {
                    let limit = delete.single_remove().then_some(1);
                    let _ = self
                        .app
                        .collections
                        .collection(db, coll)
                        .delete(&delete.selector, limit);
                }
            }
            Message::Compressed { original_op_code, .. } => {
                let reply = error_reply(&anyhow::Error::new(CommandError::bad_value(format!(
                    "OP_COMPRESSED (wrapping opcode {original_op_code}) is not supported"
                ))));
                let reply_id = self.reply_id();
                out.extend_from_slice(&OpMsg::single(reply).encode(reply_id, header.request_id)?);
                anyhow::bail!("compressed frames are not supported; closing connection");
            }
        }
        Ok(())
    }

    /// Run one command document to its reply document. Command-level
    /// failures are answered, never thrown.
    pub fn run_command(&mut self, body: Document) -> Document {
        let Some((name, _)) = body.iter().next() else {
            return error_reply(&CommandError::bad_value("empty command document").into());
        };
        let name = name.to_owned();
        let database = body
            .get("$db")
            .and_then(Value::as_str)
            .unwrap_or("test")
            .to_owned();

        tracing::debug!(command = %name, database = %database, "dispatching command");
        let result = match name.as_str() {
            "hello" | "isMaster" | "ismaster" => self.hello(&name),
            "ping" => Ok(doc! { "ok": 1.0 }),
            "buildInfo" | "buildinfo" => Ok(build_info()),
            "find" => self.find(&database, &body),
            "getMore" => self.get_more(&database, &body),
            "killCursors" => self.kill_cursors(&body),
            "insert" => self.insert(&database, &body),
            "update" => self.update(&database, &body),
            "delete" => self.delete(&database, &body),
            "aggregate" => self.aggregate(&database, &body),
            "count" => self.count(&database, &body),
            "listDatabases" => self.list_databases(),
            "listCollections" => self.list_collections(&database),
            "listIndexes" => self.list_indexes(&database, &body),
            "createIndexes" => self.create_indexes(&database, &body),
            "dropIndexes" => self.drop_indexes(&database, &body),
            "drop" => self.drop_collection(&database, &body),
            "dropDatabase" => self.drop_database(&database),
            other => Err(CommandError::command_not_found(other).into()),
        };
        match result {
            Ok(reply) => reply,
            Err(err) => {
                tracing::debug!(command = %name, error = %err, "command failed");
                error_reply(&err)
            }
        }
    }

    fn hello(&self, command: &str) -> anyhow::Result<Document> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();

        let mut reply = Document::new();
        // The legacy spelling answers with the legacy field name.
        if command == "hello" {
            reply.insert("isWritablePrimary", true);
        } else {
            reply.insert("ismaster", true);
        }
        reply.insert("maxBsonObjectSize", crate::MAX_BSON_OBJECT_SIZE);
        reply.insert("maxMessageSizeBytes", crate::MAX_MESSAGE_SIZE_BYTES);
        reply.insert("maxWriteBatchSize", 100_000);
        reply.insert("localTime", Value::DateTime(now));
        reply.insert("minWireVersion", crate::MIN_WIRE_VERSION);
        reply.insert("maxWireVersion", crate::MAX_WIRE_VERSION);
        reply.insert("readOnly", false);
        reply.insert("connectionId", self.connection_id as i64);
        reply.insert("ok", 1.0);
        Ok(reply)
    }

    fn target_collection(&self, database: &str, body: &Document, command: &str) -> anyhow::Result<Arc<crate::Collection>> {
        let name = body.get(command).and_then(Value::as_str).ok_or_else(|| {
            CommandError::type_mismatch(format!("{command} requires a collection name"))
        })?;
        Ok(self.app.collections.collection(database, name))
    }

    fn find(&mut self, database: &str, body: &Document) -> anyhow::Result<Document> {
        let collection = self.target_collection(database, body, "find")?;

        let filter = body
            .get("filter")
            .and_then(Value::as_document)
            .cloned()
            .unwrap_or_default();
        let limit = body
            .get("limit")
            .and_then(Value::as_i64)
            .filter(|n| *n != 0)
            .map(|n| n.unsigned_abs() as usize);
        let options = FindOptions {
            skip: body
                .get("skip")
                .and_then(Value::as_i64)
                .unwrap_or(0)
                .max(0) as usize,
            limit,
            sort: body.get("sort").and_then(Value::as_document).cloned(),
            projection: body
                .get("projection")
                .and_then(Value::as_document)
                .cloned(),
        };
        let batch_size = self.batch_size(body);

        let docs = collection.find(&filter, &options)?;
        Ok(self.cursor_reply(collection.namespace(), docs, batch_size))
    }

    fn batch_size(&self, body: &Document) -> usize {
        body.get("batchSize")
            .and_then(Value::as_i64)
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(self.app.config.default_batch_size)
    }

    // Build a `{cursor: {id, ns, firstBatch}}` reply, parking any
    // remainder with the cursor manager.
    fn cursor_reply(&self, namespace: String, mut docs: Vec<Document>, batch_size: usize) -> Document {
        let remainder = if docs.len() > batch_size {
            docs.split_off(batch_size)
        } else {
            Vec::new()
        };
        let cursor_id = if remainder.is_empty() {
            0
        } else {
            self.app
                .cursors
                .create(namespace.clone(), remainder, self.connection_id)
        };

        doc! {
            "cursor": doc! {
                "id": cursor_id as i64,
                "ns": namespace,
                "firstBatch": docs.into_iter().map(Value::Document).collect::<Vec<Value>>(),
            },
            "ok": 1.0,
        }
    }

    fn get_more(&mut self, database: &str, body: &Document) -> anyhow::Result<Document> {
        let cursor_id = body
            .get("getMore")
            .and_then(Value::as_i64)
            .ok_or_else(|| CommandError::type_mismatch("getMore requires a cursor id"))?;
        let collection = body
            .get("collection")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let namespace = format!("{database}.{collection}");
        let batch_size = self.batch_size(body);

        let batch = self
            .app
            .cursors
            .next_batch(cursor_id as u64, batch_size)
            .ok_or_else(|| CommandError::cursor_not_found(cursor_id))?;

        Ok(doc! {
            "cursor": doc! {
                "id": batch.cursor_id as i64,
                "ns": namespace,
                "nextBatch": batch.documents.into_iter().map(Value::Document).collect::<Vec<Value>>(),
            },
            "ok": 1.0,
        })
    }

    fn kill_cursors(&mut self, body: &Document) -> anyhow::Result<Document> {
        let ids: Vec<u64> = body
            .get("cursors")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_i64)
                    .map(|id| id as u64)
                    .collect()
            })
            .unwrap_or_default();

        let (killed, not_found) = self.app.cursors.kill(&ids);
        Ok(doc! {
            "cursorsKilled": killed.into_iter().map(|id| Value::Int64(id as i64)).collect::<Vec<Value>>(),
            "cursorsNotFound": not_found.into_iter().map(|id| Value::Int64(id as i64)).collect::<Vec<Value>>(),
            "cursorsAlive": Vec::<Value>::new(),
            "cursorsUnknown": Vec::<Value>::new(),
            "ok": 1.0,
        })
    }

    fn insert(&mut self, database: &str, body: &Document) -> anyhow::Result<Document> {
        let collection = self.target_collection(database, body, "insert")?;
        let documents: Vec<Document> = body
            .get("documents")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_document().cloned())
                    .collect()
            })
            .unwrap_or_default();

        let result = collection.insert(documents)?;
        Ok(doc! { "n": result.inserted as i32, "ok": 1.0 })
    }

    fn update(&mut self, database: &str, body: &Document) -> anyhow::Result<Document> {
        let collection = self.target_collection(database, body, "update")?;
        let updates = body
            .get("updates")
            .and_then(Value::as_array)
            .ok_or_else(|| CommandError::type_mismatch("update requires an updates array"))?;

        let mut matched = 0i64;
        let mut modified = 0i64;
        let mut upserted: Vec<Value> = Vec::new();
        for (index, spec) in updates.iter().enumerate() {
            let spec = spec
                .as_document()
                .ok_or_else(|| CommandError::type_mismatch("update entries must be documents"))?;
            let query = spec
                .get("q")
                .and_then(Value::as_document)
                .cloned()
                .unwrap_or_default();
            let update_doc = spec
                .get("u")
                .and_then(Value::as_document)
                .cloned()
                .ok_or_else(|| CommandError::type_mismatch("update entry requires u"))?;
            let multi = spec.get("multi").map_or(false, Value::is_truthy);
            let upsert = spec.get("upsert").map_or(false, Value::is_truthy);

            let result = collection.update(&query, &update_doc, multi, upsert)?;
            matched += result.matched as i64;
            modified += result.modified as i64;
            if let Some(id) = result.upserted_id {
                upserted.push(Value::Document(doc! { "index": index as i32, "_id": id }));
            }
        }

        let mut reply = doc! { "n": matched + upserted.len() as i64, "nModified": modified };
        if !upserted.is_empty() {
            reply.insert("upserted", upserted);
        }
        reply.insert("ok", 1.0);
        Ok(reply)
    }

    fn delete(&mut self, database: &str, body: &Document) -> anyhow::Result<Document> {
        let collection = self.target_collection(database, body, "delete")?;
        let deletes = body
            .get("deletes")
            .and_then(Value::as_array)
            .ok_or_else(|| CommandError::type_mismatch("delete requires a deletes array"))?;

        let mut deleted = 0i64;
        for spec in deletes {
            let spec = spec
                .as_document()
                .ok_or_else(|| CommandError::type_mismatch("delete entries must be documents"))?;
            let query = spec
                .get("q")
                .and_then(Value::as_document)
                .cloned()
                .unwrap_or_default();
            let limit = match spec.get("limit").and_then(Value::as_i64) {
                Some(0) | None => None,
                Some(n) => Some(n.max(0) as usize),
            };
            deleted += collection.delete(&query, limit)? as i64;
        }
        Ok(doc! { "n": deleted, "ok": 1.0 })
    }

    fn aggregate(&mut self, database: &str, body: &Document) -> anyhow::Result<Document> {
        let pipeline: Vec<Document> = body
            .get("pipeline")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_document().cloned())
                    .collect()
            })
            .unwrap_or_default();

        // A collection-backed pipeline seeds itself from generator output;
        // a db-level `aggregate: 1` starts empty. The leading $match (when
        // present) steers generation through find's constraint extraction.
        let (namespace, source) = match body.get("aggregate") {
            Some(Value::String(name)) => {
                let collection = self.app.collections.collection(database, name);
                let seed_query = pipeline
                    .first()
                    .and_then(|stage| stage.get("$match"))
                    .and_then(Value::as_document)
                    .cloned()
                    .unwrap_or_default();
                let source = collection.find(
                    &seed_query,
                    &FindOptions {
                        limit: Some(self.app.config.aggregate_source_size),
                        ..FindOptions::default()
                    },
                )?;
                (collection.namespace(), source)
            }
            _ => (format!("{database}.$cmd.aggregate"), Vec::new()),
        };

        let results = aggregate::execute(&self.app, database, source, &pipeline)?;
        let batch_size = self.batch_size(
            body.get("cursor")
                .and_then(Value::as_document)
                .unwrap_or(&Document::new()),
        );
        Ok(self.cursor_reply(namespace, results, batch_size))
    }

    fn count(&mut self, database: &str, body: &Document) -> anyhow::Result<Document> {
        let collection = self.target_collection(database, body, "count")?;
        let query = body
            .get("query")
            .and_then(Value::as_document)
            .cloned()
            .unwrap_or_default();
        let n = collection.count(&query)?;
        Ok(doc! { "n": n, "ok": 1.0 })
    }

    fn list_databases(&mut self) -> anyhow::Result<Document> {
        let databases: Vec<Value> = self
            .app
            .collections
            .list_databases()
            .into_iter()
            .map(|name| {
                Value::Document(doc! {
                    "name": name,
                    "sizeOnDisk": 0i64,
                    "empty": false,
                })
            })
            .collect();
        Ok(doc! { "databases": databases, "totalSize": 0i64, "ok": 1.0 })
    }

    fn list_collections(&mut self, database: &str) -> anyhow::Result<Document> {
        let docs: Vec<Document> = self
            .app
            .collections
            .list_collections(database)
            .into_iter()
            .map(|name| {
                doc! {
                    "name": name,
                    "type": "collection",
                    "options": doc! {},
                    "info": doc! { "readOnly": false },
                    "idIndex": doc! { "v": 2, "key": doc! { "_id": 1 }, "name": "_id_" },
                }
            })
            .collect();
        Ok(self.cursor_reply(
            format!("{database}.$cmd.listCollections"),
            docs,
            self.app.config.default_batch_size,
        ))
    }

    fn list_indexes(&mut self, database: &str, body: &Document) -> anyhow::Result<Document> {
        let collection = self.target_collection(database, body, "listIndexes")?;
        let namespace = collection.namespace();
        Ok(self.cursor_reply(
            namespace,
            collection.list_indexes(),
            self.app.config.default_batch_size,
        ))
    }

    fn create_indexes(&mut self, database: &str, body: &Document) -> anyhow::Result<Document> {
        let collection = self.target_collection(database, body, "createIndexes")?;
        let before = collection.index_count() as i32;

        let indexes = body
            .get("indexes")
            .and_then(Value::as_array)
            .ok_or_else(|| CommandError::type_mismatch("createIndexes requires indexes"))?;
        for index in indexes {
            let index = index
                .as_document()
                .ok_or_else(|| CommandError::type_mismatch("index specs must be documents"))?;
            let keys = index
                .get("key")
                .and_then(Value::as_document)
                .cloned()
                .ok_or_else(|| CommandError::type_mismatch("index spec requires key"))?;
            let name = index
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_owned);
            collection.create_index(&keys, name);
        }

        Ok(doc! {
            "numIndexesBefore": before,
            "numIndexesAfter": collection.index_count() as i32,
            "createdCollectionAutomatically": false,
            "ok": 1.0,
        })
    }

    fn drop_indexes(&mut self, database: &str, body: &Document) -> anyhow::Result<Document> {
        let collection = self.target_collection(database, body, "dropIndexes")?;
        let before = collection.index_count() as i32;

        match body.get("index") {
            Some(Value::String(name)) if name == "*" => collection.drop_indexes(),
            Some(Value::String(name)) => collection.drop_index(name)?,
            _ => {
                return Err(
                    CommandError::type_mismatch("dropIndexes requires an index name").into(),
                )
            }
        }
        Ok(doc! { "nIndexesWas": before, "ok": 1.0 })
    }

    fn drop_collection(&mut self, database: &str, body: &Document) -> anyhow::Result<Document> {
        let name = body
            .get("drop")
            .and_then(Value::as_str)
            .ok_or_else(|| CommandError::type_mismatch("drop requires a collection name"))?;
        self.app.collections.drop_collection(database, name)?;
        Ok(doc! { "ns": format!("{database}.{name}"), "ok": 1.0 })
    }

    fn drop_database(&mut self, database: &str) -> anyhow::Result<Document> {
        self.app.collections.drop_database(database)?;
        Ok(doc! { "dropped": database, "ok": 1.0 })
    }

    // ---- Legacy opcode paths ----

    fn handle_op_query(&mut self, query: &wire::OpQuery) -> OpReply {
        let Some((database, collection)) = query.full_collection_name.split_once('.') else {
            return OpReply::new(vec![error_reply(
                &CommandError::bad_value("invalid namespace").into(),
            )]);
        };

        // `db.$cmd` carries a command in the query document.
        if collection == "$cmd" {
            let mut body = query.query.clone();
            body.insert("$db", database);
            return OpReply::new(vec![self.run_command(body)]);
        }

        // `$query`/`$orderby` wrappers predate find options.
        let (filter, sort) = match query.query.get("$query").and_then(Value::as_document) {
            Some(inner) => (
                inner.clone(),
                query
                    .query
                    .get("$orderby")
                    .and_then(Value::as_document)
                    .cloned(),
            ),
            None => (query.query.clone(), None),
        };

        let single_batch = query.number_to_return < 0;
        let limit = match query.number_to_return {
            0 => None,
            n => Some(n.unsigned_abs() as usize),
        };
        let options = FindOptions {
            skip: query.number_to_skip.max(0) as usize,
            limit,
            sort,
            projection: query.return_fields.clone(),
        };

        let database = database.to_owned();
        let collection = self
            .app
            .collections
            .collection(&database, collection);
        match collection.find(&filter, &options) {
            Ok(mut docs) => {
                let batch_size = self.app.config.default_batch_size;
                let remainder = if !single_batch && docs.len() > batch_size {
                    docs.split_off(batch_size)
                } else {
                    Vec::new()
                };
                let cursor_id = if remainder.is_empty() {
                    0
                } else {
                    self.app.cursors.create(
                        collection.namespace(),
                        remainder,
                        self.connection_id,
                    ) as i64
                };
                OpReply {
                    response_flags: 0,
                    cursor_id,
                    starting_from: 0,
                    documents: docs,
                }
            }
            Err(err) => {
                let mut reply = OpReply::new(vec![error_reply(&err)]);
                reply.response_flags = wire::REPLY_QUERY_FAILURE;
                reply
            }
        }
    }

    fn handle_op_get_more(&mut self, get_more: &wire::OpGetMore) -> OpReply {
        let size = match get_more.number_to_return {
            n if n <= 0 => self.app.config.default_batch_size,
            n => n as usize,
        };
        match self.app.cursors.next_batch(get_more.cursor_id as u64, size) {
            Some(batch) => OpReply {
                response_flags: 0,
                cursor_id: batch.cursor_id as i64,
                starting_from: 0,
                documents: batch.documents,
            },
            None => OpReply::cursor_not_found(),
        }
    }
}

fn build_info() -> Document {
    doc! {
        "version": "7.0.0",
        "gitVersion": "floodgate",
        "versionArray": vec![Value::Int32(7), Value::Int32(0), Value::Int32(0), Value::Int32(0)],
        "bits": 64,
        "maxBsonObjectSize": crate::MAX_BSON_OBJECT_SIZE,
        "modules": Vec::<Value>::new(),
        "ok": 1.0,
    }
}
