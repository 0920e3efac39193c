//! Table of startable tasks, used for remote discovery and for building
//! tasks from typed parameter lists.

use quarry_protocol::{
    ChunkPos, DataType, Dimension, NamedEnum, ParamDescription, Parameter, Priority,
    TaskDescriptor, Value,
};

use crate::error::TaskError;
use crate::scan::{BasicScan, HighwayScan};
use crate::task::{Task, TaskSettings};

/// Typed access to the parameters of one start request.
pub struct TaskArgs<'a> {
    task: &'static str,
    params: &'a [Parameter],
}

impl<'a> TaskArgs<'a> {
    pub fn new(task: &'static str, params: &'a [Parameter]) -> Self {
        Self { task, params }
    }

    fn value(&self, name: &str) -> Result<&'a Value, TaskError> {
        self.params
            .iter()
            .find(|p| p.name() == name)
            .and_then(Parameter::single_value)
            .ok_or_else(|| TaskError::MissingParameter {
                task: self.task.to_owned(),
                param: name.to_owned(),
            })
    }

    fn wrong_type(&self, name: &str) -> TaskError {
        TaskError::InvalidParameter {
            task: self.task.to_owned(),
            param: name.to_owned(),
        }
    }

    pub fn integer(&self, name: &str) -> Result<i64, TaskError> {
        self.value(name)?
            .as_integer()
            .ok_or_else(|| self.wrong_type(name))
    }

    pub fn chunk(&self, name: &str) -> Result<ChunkPos, TaskError> {
        self.value(name)?
            .as_chunk()
            .ok_or_else(|| self.wrong_type(name))
    }

    pub fn named<E: NamedEnum>(&self, name: &str) -> Result<E, TaskError> {
        self.value(name)?
            .as_enum::<E>()
            .ok_or_else(|| self.wrong_type(name))
    }

    /// The raw parameter list, in the order it was given.
    pub fn params(&self) -> &'a [Parameter] {
        self.params
    }
}

/// Builds a task from validated arguments.
pub type TaskFactory = fn(&TaskArgs<'_>, &TaskSettings) -> Result<Box<dyn Task>, TaskError>;

/// A startable task: descriptor plus constructor.
pub struct RegisteredTask {
    pub descriptor: TaskDescriptor,
    name: &'static str,
    factory: TaskFactory,
}

/// Every task that can be started by name.
pub struct TaskRegistry {
    tasks: Vec<RegisteredTask>,
}

impl TaskRegistry {
    pub fn empty() -> Self {
        Self { tasks: Vec::new() }
    }

    /// The built-in scan tasks.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(
            HighwayScan::NAME,
            "Scans the eight highways for loaded chunks.",
            vec![
                ParamDescription::single("maxDist", DataType::Integer),
                ParamDescription::single("minDist", DataType::Integer),
                ParamDescription::single("skip", DataType::Integer),
                ParamDescription::enumeration::<Dimension>("dim"),
                ParamDescription::enumeration::<Priority>("priority"),
            ],
            |args, settings| {
                Ok(Box::new(HighwayScan::new(
                    args.params().to_vec(),
                    args.integer("minDist")?,
                    args.integer("maxDist")?,
                    args.integer("skip")?,
                    args.named("dim")?,
                    args.named("priority")?,
                    settings,
                )?))
            },
        );
        registry.register(
            BasicScan::NAME,
            "Scans a rectangle of chunks.",
            vec![
                ParamDescription::single("start", DataType::ChunkPosition),
                ParamDescription::single("end", DataType::ChunkPosition),
                ParamDescription::single("skip", DataType::Integer),
                ParamDescription::enumeration::<Dimension>("dim"),
                ParamDescription::enumeration::<Priority>("priority"),
            ],
            |args, settings| {
                Ok(Box::new(BasicScan::new(
                    args.params().to_vec(),
                    args.chunk("start")?,
                    args.chunk("end")?,
                    args.integer("skip")?,
                    args.named("dim")?,
                    args.named("priority")?,
                    settings,
                )?))
            },
        );
        registry
    }

    pub fn register(
        &mut self,
        name: &'static str,
        description: &str,
        params: Vec<ParamDescription>,
        factory: TaskFactory,
    ) {
        self.tasks.push(RegisteredTask {
            descriptor: TaskDescriptor {
                name: name.to_owned(),
                description: description.to_owned(),
                params,
            },
            name,
            factory,
        });
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.tasks.iter().map(|t| &t.descriptor)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTask> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Check `params` against the descriptor and build the task.
    pub fn create(
        &self,
        name: &str,
        params: &[Parameter],
        settings: &TaskSettings,
    ) -> Result<Box<dyn Task>, TaskError> {
        let registered = self
            .get(name)
            .ok_or_else(|| TaskError::UnknownTaskType(name.to_owned()))?;

        for param in params {
            let Some(description) = registered
                .descriptor
                .params
                .iter()
                .find(|d| d.name == param.name())
            else {
                return Err(TaskError::UnknownParameter {
                    task: registered.name.to_owned(),
                    param: param.name().to_owned(),
                });
            };
            if !description.accepts(&param.value) {
                return Err(TaskError::InvalidParameter {
                    task: registered.name.to_owned(),
                    param: param.name().to_owned(),
                });
            }
        }

        (registered.factory)(&TaskArgs::new(registered.name, params), settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn highway_params() -> Vec<Parameter> {
        vec![
            Parameter::single("maxDist", Value::Integer(1000)),
            Parameter::single("minDist", Value::Integer(0)),
            Parameter::single("skip", Value::Integer(12)),
            Parameter::single("dim", Value::Enum("OVERWORLD".into())),
            Parameter::single("priority", Value::Enum("MEDIUM".into())),
        ]
    }

    #[test]
    fn test_standard_descriptors() {
        let registry = TaskRegistry::standard();
        let names: Vec<_> = registry.descriptors().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["highway_scan", "basic_scan"]);
        let highway = registry.get("highway_scan").unwrap();
        assert_eq!(highway.descriptor.params.len(), 5);
        assert_eq!(highway.descriptor.params[3].enum_values, ["NETHER", "OVERWORLD", "END"]);
    }

    #[test]
    fn test_create_highway_scan() {
        let registry = TaskRegistry::standard();
        let task = registry
            .create("highway_scan", &highway_params(), &TaskSettings::default())
            .unwrap();
        assert_eq!(task.name(), "highway_scan");
        assert_eq!(task.parameters(), highway_params());
        assert_eq!(task.progress(), Some(0.0));
    }

    #[test]
    fn test_create_rejects_bad_params() {
        let registry = TaskRegistry::standard();
        let settings = TaskSettings::default();

        let mut missing = highway_params();
        missing.remove(0);
        assert!(matches!(
            registry.create("highway_scan", &missing, &settings),
            Err(TaskError::MissingParameter { param, .. }) if param == "maxDist"
        ));

        let mut wrong = highway_params();
        wrong[2] = Parameter::single("skip", Value::Boolean(true));
        assert!(matches!(
            registry.create("highway_scan", &wrong, &settings),
            Err(TaskError::InvalidParameter { param, .. }) if param == "skip"
        ));

        let mut bad_enum = highway_params();
        bad_enum[3] = Parameter::single("dim", Value::Enum("MOON".into()));
        assert!(registry.create("highway_scan", &bad_enum, &settings).is_err());

        let mut extra = highway_params();
        extra.push(Parameter::single("speed", Value::Integer(3)));
        assert!(matches!(
            registry.create("highway_scan", &extra, &settings),
            Err(TaskError::UnknownParameter { .. })
        ));

        assert!(matches!(
            registry.create("nope", &[], &settings),
            Err(TaskError::UnknownTaskType(_))
        ));
    }

    #[test]
    fn test_create_basic_scan() {
        let registry = TaskRegistry::standard();
        let params = vec![
            Parameter::single("start", Value::ChunkPosition(ChunkPos::new(-2, -2))),
            Parameter::single("end", Value::ChunkPosition(ChunkPos::new(2, 2))),
            Parameter::single("skip", Value::Integer(1)),
            Parameter::single("dim", Value::Enum("NETHER".into())),
            Parameter::single("priority", Value::Enum("LOW".into())),
        ];
        let task = registry
            .create("basic_scan", &params, &TaskSettings::default())
            .unwrap();
        assert_eq!(task.name(), "basic_scan");
        assert!(!task.is_finished());
    }
}
