//! 共享上下文存储
//!
//! 每次运行一个 Context，由 FlowRunner 独占。字段值以 JSON 保存（便于比较与快照），
//! 读写通过带类型的 Field<T>。写入遵循「单字段单写者」：字段在构图时声明归属节点，
//! 其它节点写入即报错。并行分支通过 fork 得到子上下文，全部完成后在屏障处 merge，
//! 两个分支对同一字段写入不同值视为冲突，不采用后写覆盖。

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::ContextError;
use crate::flow::types::Field;

#[derive(Debug, Clone, Default)]
pub struct Context {
    values: BTreeMap<String, Value>,
    /// 字段 -> 归属节点
    owners: HashMap<String, String>,
    /// 自创建 / fork 以来被写过的字段（merge 只回写这些）
    dirty: BTreeSet<String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 JSON 快照恢复（所有字段视为初始输入，无归属）
    pub fn from_snapshot(snapshot: Map<String, Value>) -> Self {
        Self {
            values: snapshot.into_iter().collect(),
            ..Self::default()
        }
    }

    /// 导出 JSON 快照（键有序）
    pub fn snapshot(&self) -> Map<String, Value> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// 写入初始输入字段（运行开始前，不经归属检查）
    pub fn seed<T: Serialize>(&mut self, field: Field<T>, value: &T) -> Result<(), ContextError> {
        let value = encode(field.name(), value)?;
        self.values.insert(field.name().to_string(), value);
        Ok(())
    }

    pub(crate) fn seed_raw(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    /// 声明字段归属；同一字段只能有一个归属节点
    pub fn declare_owner(&mut self, field: &str, owner: &str) -> Result<(), ContextError> {
        match self.owners.get(field) {
            Some(existing) if existing != owner => Err(ContextError::NotOwner {
                field: field.to_string(),
                owner: existing.clone(),
                writer: owner.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.owners.insert(field.to_string(), owner.to_string());
                Ok(())
            }
        }
    }

    pub fn owner(&self, field: &str) -> Option<&str> {
        self.owners.get(field).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn get_raw(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get<T: DeserializeOwned>(&self, field: Field<T>) -> Result<T, ContextError> {
        self.get_opt(field)?
            .ok_or_else(|| ContextError::MissingField(field.name().to_string()))
    }

    pub fn get_opt<T: DeserializeOwned>(&self, field: Field<T>) -> Result<Option<T>, ContextError> {
        match self.values.get(field.name()) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| ContextError::Decode {
                    field: field.name().to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    pub fn set<T: Serialize>(
        &mut self,
        writer: &str,
        field: Field<T>,
        value: &T,
    ) -> Result<(), ContextError> {
        let value = encode(field.name(), value)?;
        self.set_raw(writer, field.name(), value)
    }

    pub fn set_raw(&mut self, writer: &str, name: &str, value: Value) -> Result<(), ContextError> {
        match self.owners.get(name) {
            Some(owner) if owner == writer => {}
            Some(owner) => {
                return Err(ContextError::NotOwner {
                    field: name.to_string(),
                    owner: owner.clone(),
                    writer: writer.to_string(),
                })
            }
            None => {
                return Err(ContextError::Undeclared {
                    field: name.to_string(),
                })
            }
        }
        self.values.insert(name.to_string(), value);
        self.dirty.insert(name.to_string());
        Ok(())
    }

    /// 浅拷贝指定字段，得到并行分支使用的子上下文（不继承归属与脏标记）
    pub fn fork(&self, fields: &[&str]) -> Context {
        let values = fields
            .iter()
            .filter_map(|name| self.values.get(*name).map(|v| (name.to_string(), v.clone())))
            .collect();
        Context {
            values,
            owners: HashMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// 只携带指定字段开始下一段流程（链式运行时使用）
    pub fn carry(&self, fields: &[&str]) -> Context {
        self.fork(fields)
    }

    /// 屏障处回写所有子上下文中被修改的字段。
    ///
    /// 任意两个子上下文对同一字段写入不同的值即返回 Conflict，且父上下文保持不变。
    pub fn merge(&mut self, children: Vec<Context>) -> Result<(), ContextError> {
        let mut staged: BTreeMap<String, (usize, Value)> = BTreeMap::new();
        for (index, child) in children.into_iter().enumerate() {
            let Context {
                mut values, dirty, ..
            } = child;
            for name in dirty {
                let Some(value) = values.remove(&name) else {
                    continue;
                };
                match staged.get(&name) {
                    Some((first, existing)) if *existing != value => {
                        return Err(ContextError::Conflict {
                            field: name,
                            first: *first,
                            second: index,
                        });
                    }
                    Some(_) => {}
                    None => {
                        staged.insert(name, (index, value));
                    }
                }
            }
        }
        for (name, (_, value)) in staged {
            self.values.insert(name.clone(), value);
            self.dirty.insert(name);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn dirty_fields(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

fn encode<T: Serialize>(name: &str, value: &T) -> Result<Value, ContextError> {
    serde_json::to_value(value).map_err(|e| ContextError::Encode {
        field: name.to_string(),
        reason: e.to_string(),
    })
}
