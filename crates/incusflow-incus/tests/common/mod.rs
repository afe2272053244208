use incusflow_core::{CommandExecutor, ExecOutput, Result};
use serde_json::{Value, json};
use std::cell::RefCell;
use std::collections::BTreeMap;

/// In-memory incus server understanding the profile, network and project
/// sub-commands
#[derive(Default)]
pub struct FakeIncus {
    objects: RefCell<BTreeMap<String, BTreeMap<String, Value>>>,
    log: RefCell<Vec<Vec<String>>>,
}

const READ_VERBS: &[&str] = &["show", "list"];

impl FakeIncus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, noun: &str, name: &str, object: Value) -> Self {
        let mut object = object;
        let base = blank(name);
        if let (Some(obj), Value::Object(defaults)) = (object.as_object_mut(), base) {
            for (key, value) in defaults {
                obj.entry(key).or_insert(value);
            }
        }
        self.objects
            .borrow_mut()
            .entry(noun.to_string())
            .or_default()
            .insert(name.to_string(), object);
        self
    }

    pub fn get(&self, noun: &str, name: &str) -> Option<Value> {
        self.objects.borrow().get(noun)?.get(name).cloned()
    }

    pub fn config(&self, noun: &str, name: &str, key: &str) -> Option<String> {
        self.get(noun, name)?
            .get("config")?
            .get(key)
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
    }

    /// Calls that changed something, as command lines without the binary
    pub fn mutations(&self) -> Vec<String> {
        self.log
            .borrow()
            .iter()
            .filter(|args| args.len() < 2 || !READ_VERBS.contains(&args[1].as_str()))
            .map(|args| args.join(" "))
            .collect()
    }

    fn handle(&self, args: &[String], stdin: Option<&[u8]>) -> ExecOutput {
        let (Some(noun), Some(verb)) = (args.first(), args.get(1)) else {
            return fail("Error: unknown command");
        };
        let rest = &args[2..];
        let mut objects = self.objects.borrow_mut();
        let table = objects.entry(noun.clone()).or_default();
        let name = rest.first().cloned().unwrap_or_default();

        match verb.as_str() {
            "show" => match table.get(&name) {
                Some(object) => ok(&serde_yaml::to_string(object).unwrap()),
                None => fail(&format!("Error: {} not found", noun)),
            },
            "create" => {
                if table.contains_key(&name) {
                    return fail(&format!("Error: {} already exists", noun));
                }
                let mut object = blank(&name);
                for arg in &rest[1..] {
                    if let Some(kind) = arg.strip_prefix("--type=") {
                        object["type"] = json!(kind);
                    } else if let Some((key, value)) = arg.split_once('=') {
                        object["config"][key] = json!(value);
                    }
                }
                table.insert(name, object);
                ok("")
            }
            "edit" => {
                let Some(object) = table.get_mut(&name) else {
                    return fail("Error: not found");
                };
                let doc: Value = serde_yaml::from_slice(stdin.unwrap_or_default()).unwrap();
                for (key, value) in doc.as_object().cloned().unwrap_or_default() {
                    if key != "name" && key != "used_by" {
                        object[key.as_str()] = value;
                    }
                }
                ok("")
            }
            "set" | "unset" => {
                let Some(object) = table.get_mut(&name) else {
                    return fail("Error: not found");
                };
                let property = rest.iter().any(|a| a == "--property");
                let Some(pair) = rest.get(1) else {
                    return fail("Error: missing key");
                };
                let (key, value) = match pair.split_once('=') {
                    Some((k, v)) => (k.to_string(), Some(v.to_string())),
                    None => (pair.clone(), None),
                };
                let target = if property {
                    object.as_object_mut().unwrap()
                } else {
                    object["config"].as_object_mut().unwrap()
                };
                match (verb.as_str(), value) {
                    ("set", Some(value)) => {
                        target.insert(key, json!(value));
                    }
                    _ => {
                        target.remove(&key);
                    }
                }
                ok("")
            }
            "rename" => {
                let Some(to) = rest.get(1) else {
                    return fail("Error: missing name");
                };
                let Some(mut object) = table.remove(&name) else {
                    return fail("Error: not found");
                };
                object["name"] = json!(to);
                table.insert(to.clone(), object);
                ok("")
            }
            "delete" => match table.get(&name) {
                None => fail("Error: not found"),
                Some(object) if !used_by(object).is_empty() => {
                    fail(&format!("Error: The {} is currently in use", noun))
                }
                Some(_) => {
                    table.remove(&name);
                    ok("")
                }
            },
            // profile remove <instance> <profile>
            "remove" => {
                let Some(profile) = rest.get(1).and_then(|p| table.get_mut(p)) else {
                    return fail("Error: not found");
                };
                let entry = format!("/1.0/instances/{}", name);
                if let Some(list) = profile["used_by"].as_array_mut() {
                    list.retain(|u| u.as_str().map(|s| !s.starts_with(&entry)).unwrap_or(true));
                }
                ok("")
            }
            _ => fail(&format!("Error: unsupported verb {}", verb)),
        }
    }
}

impl CommandExecutor for FakeIncus {
    fn execute(&self, argv: &[String], stdin: Option<&[u8]>) -> Result<ExecOutput> {
        let mut args: Vec<String> = argv[1..].to_vec();
        if args.first().map(String::as_str) == Some("--project") {
            args.drain(..2);
        }
        self.log.borrow_mut().push(args.clone());
        Ok(self.handle(&args, stdin))
    }
}

fn blank(name: &str) -> Value {
    json!({
        "name": name,
        "description": "",
        "config": {},
        "devices": {},
        "used_by": [],
    })
}

fn used_by(object: &Value) -> Vec<Value> {
    object["used_by"].as_array().cloned().unwrap_or_default()
}

fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        rc: 0,
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

fn fail(stderr: &str) -> ExecOutput {
    ExecOutput {
        rc: 1,
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}
