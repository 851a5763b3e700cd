//! 工具描述符与参数 Schema
//!
//! ToolDescriptor 声明工具的输入参数（类型 / 必填 / 约束）、输出字段、计费类别与幂等性；
//! validate_args 在任何调用发生前做预检，把一整类运行期误用转成 SchemaError。
//! schemars 用于导出描述符本身的 JSON Schema（`conductor tools --schema`）。

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use regex::Regex;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 参数 pattern 的编译结果，按源字符串缓存（Regex clone 只增加引用计数）
static PATTERN_CACHE: OnceLock<Mutex<HashMap<String, Regex>>> = OnceLock::new();

fn compiled_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let mut cache = PATTERN_CACHE
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(re) = cache.get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern)?;
    cache.insert(pattern.to_string(), re.clone());
    Ok(re)
}

/// 计费类别：free 可直接调用；metered 在同一次运行中首次调用前需要人工授权
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    #[default]
    Free,
    Metered,
}

/// 参数类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl ParamType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        };
        f.write_str(s)
    }
}

/// 单个命名参数及其约束
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: ParamType,
    #[serde(default)]
    pub required: bool,
    /// 字符串 / 数组不可为空
    #[serde(default)]
    pub non_empty: bool,
    /// 字符串须匹配的正则
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// 枚举取值
    #[serde(default)]
    pub one_of: Vec<Value>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Self::default()
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::String)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn non_empty(mut self) -> Self {
        self.non_empty = true;
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// 校验单个值；返回人类可读的失败原因
    fn check(&self, value: &Value) -> Result<(), String> {
        if !self.kind.matches(value) {
            return Err(format!("'{}' must be {}, got {}", self.name, self.kind, value));
        }
        if self.non_empty {
            let empty = match value {
                Value::String(s) => s.trim().is_empty(),
                Value::Array(a) => a.is_empty(),
                _ => false,
            };
            if empty {
                return Err(format!("'{}' must not be empty", self.name));
            }
        }
        if let (Some(pattern), Some(s)) = (&self.pattern, value.as_str()) {
            let re = compiled_pattern(pattern)
                .map_err(|e| format!("'{}' has invalid pattern {}: {}", self.name, pattern, e))?;
            if !re.is_match(s) {
                return Err(format!("'{}' does not match pattern {}", self.name, pattern));
            }
        }
        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    return Err(format!("'{}' must be >= {}", self.name, min));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return Err(format!("'{}' must be <= {}", self.name, max));
                }
            }
        }
        if !self.one_of.is_empty() && !self.one_of.contains(value) {
            return Err(format!("'{}' must be one of {:?}", self.name, self.one_of));
        }
        Ok(())
    }
}

/// 工具描述符：加载注册表时创建，运行期间不可变
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// 输出字段名；成功结果按字段名写入运行的 artifacts
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub cost: CostClass,
    #[serde(default)]
    pub idempotent: bool,
    /// 可替代本工具的其它工具（纠错时的备选）
    #[serde(default)]
    pub alternates: Vec<String>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn metered(mut self) -> Self {
        self.cost = CostClass::Metered;
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn alternate(mut self, tool: impl Into<String>) -> Self {
        self.alternates.push(tool.into());
        self
    }

    pub fn is_metered(&self) -> bool {
        self.cost == CostClass::Metered
    }

    pub fn param_spec(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// 同名重复注册时判断是否兼容：除描述文字外全部一致（契约、计费、幂等性、替代工具）
    pub fn is_compatible(&self, other: &ToolDescriptor) -> bool {
        self.params == other.params
            && self.outputs == other.outputs
            && self.cost == other.cost
            && self.idempotent == other.idempotent
            && self.alternates == other.alternates
    }

    /// 按描述符校验参数；args 必须是对象（null 视为空对象），不允许未声明字段
    pub fn validate(&self, args: &Value) -> Result<(), String> {
        let empty = serde_json::Map::new();
        let obj = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => return Err(format!("arguments must be an object, got {}", other)),
        };
        for key in obj.keys() {
            if self.param_spec(key).is_none() {
                return Err(format!("unexpected argument '{}'", key));
            }
        }
        for spec in &self.params {
            match obj.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(format!("missing required argument '{}'", spec.name));
                }
                None | Some(Value::Null) => {}
                Some(value) => spec.check(value)?,
            }
        }
        Ok(())
    }
}

/// 返回 ToolDescriptor 的 JSON Schema 字符串
pub fn descriptor_schema_json() -> String {
    let schema = schema_for!(ToolDescriptor);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
