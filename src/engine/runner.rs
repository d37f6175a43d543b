use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::CancelFlag;
use crate::engine::graph::{TaskGraph, TaskNode};
use crate::error::TaskError;
use crate::generator::{BuildContext, BuildOutput};
use crate::output::{Formatters, GeneratorOutput, GeneratorTaskOutputBuilder};
use crate::provider::{ProviderExport, ProviderSet, TaskProviders};

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Execution metrics of a run, keyed by task id.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub execution_times: BTreeMap<String, TaskExecution>,
}

impl Diagnostics {
    /// Task ids ordered from slowest to fastest.
    pub fn slowest(&self) -> Vec<(&str, Duration)> {
        let mut tasks: Vec<_> = self
            .execution_times
            .iter()
            .map(|(id, exec)| (id.as_str(), exec.duration))
            .collect();
        tasks.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        tasks
    }

    /// Renders the task graph as a Mermaid diagram, colored from green
    /// (fastest) to red (slowest). Tasks that never ran are grey.
    pub fn render_mermaid(&self, graph: &TaskGraph) -> String {
        use std::fmt::Write;

        let secs = || self.execution_times.values().map(|t| t.duration.as_secs_f64());
        let min = secs().fold(f64::MAX, f64::min);
        let max = secs().fold(0.0, f64::max);
        let span = if max - min > f64::EPSILON { max - min } else { 1.0 };

        let mut f = String::from("graph LR\n");
        for index in graph.graph.node_indices() {
            let node = &graph.graph[index];
            let name = node.id.replace('"', "\\\"");

            let (label, color) = match self.execution_times.get(&node.id) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min) / span;
                    let (r, g) = if t < 0.5 {
                        ((510.0 * t) as u8, 255)
                    } else {
                        (255, (510.0 * (1.0 - t)) as u8)
                    };
                    (format!("{:.2?}", exec.duration), format!("#{r:02X}{g:02X}00"))
                }
                None => (String::from("skipped"), String::from("#D3D3D3")),
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label);
            let _ = writeln!(f, "    style {} fill:{}", index.index(), color);
        }

        for edge in graph.graph.raw_edges() {
            let _ = writeln!(
                f,
                "    {} -- \"{}\" --> {}",
                edge.source().index(),
                edge.weight.provider,
                edge.target().index()
            );
        }

        f
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Worker threads, defaults to the available parallelism.
    pub concurrency: Option<usize>,
    pub formatters: Formatters,
    pub cancel: CancelFlag,
}

#[derive(Debug)]
pub struct RunOutput {
    pub output: GeneratorOutput,
    pub diagnostics: Diagnostics,
}

/// Providers a finished task makes available to its dependents.
struct NodeData {
    exports: ProviderSet,
    outputs: ProviderSet,
}

struct TaskResult {
    data: NodeData,
    output: GeneratorOutput,
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Worker pool with `concurrency` threads, or one per core when unset.
///
/// The same pool bounds task execution and the file I/O of a sync.
pub(crate) fn worker_pool(concurrency: Option<usize>) -> Result<ThreadPool, TaskError> {
    let threads = concurrency.unwrap_or_else(default_concurrency).max(1);
    let pool = ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("kumitate-worker-{i}"))
        .build()?;
    Ok(pool)
}

/// Executes the task graph on a bounded thread pool.
///
/// Tasks are spawned as soon as all of their producers finished, so
/// independent parts of the graph run in parallel. Every task runs its `run`
/// phase, then its `build` phase, then its builder actions; only after all
/// three are its dependents unlocked.
///
/// The first failure stops the scheduling of new tasks. Tasks already in
/// flight are awaited and the error is returned.
pub fn run_task_graph(graph: &TaskGraph, options: &RunOptions) -> Result<RunOutput, TaskError> {
    let pool = worker_pool(options.concurrency)?;
    run_task_graph_on(graph, options, &pool)
}

/// Same as [`run_task_graph`], on a pool owned by the caller.
/// `options.concurrency` is ignored in favour of the pool size.
pub(crate) fn run_task_graph_on(
    graph: &TaskGraph,
    options: &RunOptions,
    pool: &ThreadPool,
) -> Result<RunOutput, TaskError> {
    let graph_ref = &graph.graph;
    let total_tasks = graph_ref.node_count();

    if total_tasks == 0 {
        return Ok(RunOutput {
            output: GeneratorOutput::new(),
            diagnostics: Diagnostics::default(),
        });
    }

    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for edge in graph_ref.raw_edges() {
        dependents
            .entry(edge.source())
            .or_default()
            .push(edge.target());
    }

    let mut dependency_counts: HashMap<NodeIndex, usize> = graph_ref
        .node_indices()
        .map(|i| {
            let count = graph_ref
                .neighbors_directed(i, petgraph::Direction::Incoming)
                .count();
            (i, count)
        })
        .collect();

    let root_span = tracing::span!(Level::INFO, "generating");
    root_span.pb_set_length(total_tasks as u64);
    root_span.pb_set_style(&crate::utils::get_style_bar());
    root_span.pb_set_message("Running generator tasks...");
    let _enter = root_span.enter();

    let pb_style = crate::utils::get_style_task();

    let mut results: HashMap<NodeIndex, NodeData> = HashMap::new();
    let mut output = GeneratorOutput::new();
    let mut execution_times = BTreeMap::new();
    let mut failure: Option<TaskError> = None;

    pool.in_place_scope(|s| {
        let (result_sender, result_receiver) =
            channel::<(NodeIndex, Result<TaskResult, TaskError>, Instant, Duration)>();

        let spawn_task = |results: &HashMap<NodeIndex, NodeData>, index: NodeIndex| {
            let node = &graph_ref[index];
            let providers = collect_providers(node, results);
            let sender = result_sender.clone();
            let pb_style = pb_style.clone();
            let formatters = options.formatters.clone();

            s.spawn(move |_| {
                let span = tracing::span!(Level::INFO, "task", id = %node.id);
                span.pb_set_style(&pb_style);
                span.pb_set_message(&format!("Running {}", node.id));
                let _enter = span.enter();

                let start_time = Instant::now();

                // The task only sees cloned providers, so a panic cannot leave
                // shared state half-updated.
                let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    execute_task(node, &providers, formatters)
                })) {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = if let Some(s) = panic.downcast_ref::<&str>() {
                            s.to_string()
                        } else if let Some(s) = panic.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            String::from("unknown payload")
                        };

                        Err(TaskError::Panic {
                            task: node.id.clone(),
                            message,
                        })
                    }
                };

                let elapsed = start_time.elapsed();
                let _ = sender.send((index, result, start_time, elapsed));
            });
        };

        let mut in_flight = 0usize;

        for index in graph_ref.node_indices() {
            if dependency_counts[&index] == 0 {
                if options.cancel.is_cancelled() {
                    failure = Some(TaskError::Cancelled);
                    break;
                }
                spawn_task(&results, index);
                in_flight += 1;
            }
        }

        while in_flight > 0 {
            let Ok((completed, result, start, duration)) = result_receiver.recv() else {
                break;
            };
            in_flight -= 1;
            root_span.pb_inc(1);

            let id = graph_ref[completed].id.clone();
            execution_times.insert(id.clone(), TaskExecution { start, duration });

            let merged = result.and_then(|result| {
                output.merge(result.output)?;
                Ok(result.data)
            });

            match merged {
                Ok(data) => {
                    tracing::debug!(task = %id, "finished task in {duration:.2?}");
                    results.insert(completed, data);
                }
                Err(err) => {
                    tracing::error!(task = %id, "{err}");
                    failure.get_or_insert(err);
                }
            }

            if failure.is_some() {
                continue;
            }

            if let Some(dependents_of_completed) = dependents.get(&completed) {
                for &index in dependents_of_completed {
                    if let Some(count) = dependency_counts.get_mut(&index) {
                        *count -= 1;
                        if *count == 0 {
                            if options.cancel.is_cancelled() {
                                failure = Some(TaskError::Cancelled);
                                break;
                            }
                            spawn_task(&results, index);
                            in_flight += 1;
                        }
                    }
                }
            }
        }
    });

    if let Some(err) = failure {
        return Err(err);
    }

    tracing::info!(
        tasks = total_tasks,
        files = output.len(),
        "generation complete"
    );

    Ok(RunOutput {
        output,
        diagnostics: Diagnostics { execution_times },
    })
}

fn collect_providers(node: &TaskNode, results: &HashMap<NodeIndex, NodeData>) -> TaskProviders {
    let values = node
        .dependencies
        .iter()
        .map(|(key, resolved)| {
            let value = resolved.as_ref().and_then(|dep| {
                let data = results.get(&dep.producer)?;
                let set = if dep.output { &data.outputs } else { &data.exports };
                set.get(&dep.key).cloned()
            });
            (key.clone(), value)
        })
        .collect();

    TaskProviders { values }
}

/// Checks that a task returned exactly the providers it declared, each
/// holding a value of the declared type.
fn check_declared(
    task_id: &str,
    declared: &BTreeMap<String, ProviderExport>,
    provided: &ProviderSet,
) -> Result<(), TaskError> {
    for (key, export) in declared {
        let Some(value) = provided.get(key) else {
            return Err(TaskError::MissingProvider {
                task: task_id.to_string(),
                key: key.clone(),
            });
        };
        if (**value).type_id() != export.provider().type_id {
            return Err(TaskError::ProviderTypeMismatch {
                task: task_id.to_string(),
                key: key.clone(),
                expected: export.provider().type_name(),
            });
        }
    }

    for key in provided.keys() {
        if !declared.contains_key(key) {
            return Err(TaskError::UndeclaredProvider {
                task: task_id.to_string(),
                key: key.to_string(),
            });
        }
    }

    Ok(())
}

fn execute_task(
    node: &TaskNode,
    providers: &TaskProviders,
    formatters: Formatters,
) -> Result<TaskResult, TaskError> {
    let task = &node.task;

    let run = (task.run)(providers).map_err(|source| TaskError::Run {
        task: node.id.clone(),
        source: source.into(),
    })?;
    check_declared(&node.id, &task.exports, &run.providers)?;

    let built = match run.build {
        None => BuildOutput::new(),
        Some(build) => {
            let context = BuildContext {
                task_id: node.id.clone(),
                generator_name: node.generator_name.clone(),
                base_directory: node.base_directory.clone(),
            };
            build(&context).map_err(|source| TaskError::Build {
                task: node.id.clone(),
                source: source.into(),
            })?
        }
    };
    check_declared(&node.id, &task.outputs, &built.outputs)?;

    let mut builder = GeneratorTaskOutputBuilder::new(
        node.generator_name.clone(),
        node.base_directory.clone(),
        formatters,
    );
    for action in &built.actions {
        builder
            .apply(action.as_ref())
            .map_err(|source| TaskError::Action {
                task: node.id.clone(),
                source,
            })?;
    }

    Ok(TaskResult {
        data: NodeData {
            exports: run.providers,
            outputs: built.outputs,
        },
        output: builder.finish(),
    })
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::engine::entry::build_generator_entry;
    use crate::generator::{GeneratorBundle, TaskDefinition, TaskRun};
    use crate::output::{FileContents, WriteFile};
    use crate::provider::ProviderType;

    fn config() -> ProviderType<String> {
        ProviderType::new("config")
    }

    fn build_graph(bundle: GeneratorBundle) -> TaskGraph {
        TaskGraph::build(&build_generator_entry(&bundle).unwrap()).unwrap()
    }

    fn options(concurrency: usize) -> RunOptions {
        RunOptions {
            concurrency: Some(concurrency),
            ..Default::default()
        }
    }

    #[test]
    fn test_consumer_receives_exact_provider_value() {
        let seen = Arc::new(Mutex::new(None));
        let seen_in_task = seen.clone();

        let producer = TaskDefinition::builder("setup")
            .export("config", config().export())
            .run(|_| Ok(TaskRun::new().provide("config", String::from("strict"))));
        let consumer = TaskDefinition::builder("main")
            .dependency("config", config().dependency())
            .run(move |providers| {
                let value = providers.get::<String>("config")?;
                *seen_in_task.lock().unwrap() = Some(value.clone());
                Ok(TaskRun::new())
            });

        let graph = build_graph(
            GeneratorBundle::new("app", "gen/app")
                .task(producer)
                .child("child", GeneratorBundle::new("child", "gen/child").task(consumer)),
        );

        run_task_graph(&graph, &options(2)).unwrap();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("strict"));
    }

    #[test]
    fn test_build_actions_produce_files() {
        let models = ["user", "post", "comment"].map(|name| {
            let task = TaskDefinition::builder("main").run(move |_| {
                Ok(TaskRun::new().build(move |ctx| {
                    assert_eq!(ctx.generator_name, "prisma-model");
                    Ok(BuildOutput::new().action(WriteFile::new(
                        format!("src/models/{name}.ts"),
                        format!("export const {name} = {{}};\n"),
                    )))
                }))
            });
            (name, GeneratorBundle::new("prisma-model", "gen/model").task(task))
        });

        let graph = build_graph(GeneratorBundle::new("app", "gen/app").children("models", models));

        for concurrency in [1, 4] {
            let run = run_task_graph(&graph, &options(concurrency)).unwrap();
            let paths: Vec<_> = run.output.files.keys().cloned().collect();
            assert_eq!(
                paths,
                [
                    "src/models/comment.ts",
                    "src/models/post.ts",
                    "src/models/user.ts"
                ]
            );
            assert_eq!(
                run.output.files["src/models/user.ts"].contents,
                FileContents::Utf8("export const user = {};\n".into())
            );
            assert_eq!(run.diagnostics.execution_times.len(), 3);
        }
    }

    #[test]
    fn test_output_dependency_receives_build_value() {
        let routes = ProviderType::<Vec<String>>::new("routes");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_task = seen.clone();

        let producer = TaskDefinition::builder("router")
            .output("routes", routes.export())
            .run(|_| {
                Ok(TaskRun::new().build(|_| {
                    Ok(BuildOutput::new().output("routes", vec![String::from("/users")]))
                }))
            });
        let consumer = TaskDefinition::builder("sitemap")
            .dependency("routes", routes.output_dependency())
            .run(move |providers| {
                seen_in_task
                    .lock()
                    .unwrap()
                    .extend(providers.get::<Vec<String>>("routes")?.iter().cloned());
                Ok(TaskRun::new())
            });

        let graph = build_graph(GeneratorBundle::new("app", "gen/app").task(producer).task(consumer));
        run_task_graph(&graph, &options(2)).unwrap();
        assert_eq!(*seen.lock().unwrap(), ["/users"]);
    }

    #[test]
    fn test_run_failure_is_wrapped_and_stops_dependents() {
        let dependent_ran = Arc::new(AtomicBool::new(false));
        let flag = dependent_ran.clone();

        let failing = TaskDefinition::builder("main")
            .export("config", config().export())
            .run(|_| Err(anyhow::anyhow!("database url is missing")));
        let dependent = TaskDefinition::builder("dependent")
            .dependency("config", config().dependency())
            .run(move |_| {
                flag.store(true, Ordering::SeqCst);
                Ok(TaskRun::new())
            });

        let graph = build_graph(GeneratorBundle::new("app", "gen/app").task(failing).task(dependent));
        let err = run_task_graph(&graph, &options(2)).unwrap_err();

        assert_eq!(err.to_string(), "task 'root#main' failed during run");
        assert_eq!(
            err.source().unwrap().to_string(),
            "database url is missing"
        );
        assert!(!dependent_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_build_failure_is_wrapped() {
        let task = TaskDefinition::builder("main").run(|_| {
            Ok(TaskRun::new().build(|_| Err(anyhow::anyhow!("template missing"))))
        });
        let graph = build_graph(GeneratorBundle::new("app", "gen/app").task(task));

        let err = run_task_graph(&graph, &options(1)).unwrap_err();
        assert!(matches!(err, TaskError::Build { ref task, .. } if task == "root#main"));
    }

    #[test]
    fn test_panic_is_reported() {
        let task = TaskDefinition::builder("main").run(|_| panic!("boom"));
        let graph = build_graph(GeneratorBundle::new("app", "gen/app").task(task));

        let err = run_task_graph(&graph, &options(1)).unwrap_err();
        assert!(matches!(err, TaskError::Panic { ref message, .. } if message == "boom"));
    }

    #[test]
    fn test_declared_exports_are_checked() {
        let missing = TaskDefinition::builder("main")
            .export("config", config().export())
            .run(|_| Ok(TaskRun::new()));
        let graph = build_graph(GeneratorBundle::new("app", "gen/app").task(missing));
        assert!(matches!(
            run_task_graph(&graph, &options(1)).unwrap_err(),
            TaskError::MissingProvider { .. }
        ));

        let undeclared = TaskDefinition::builder("main")
            .run(|_| Ok(TaskRun::new().provide("config", String::new())));
        let graph = build_graph(GeneratorBundle::new("app", "gen/app").task(undeclared));
        assert!(matches!(
            run_task_graph(&graph, &options(1)).unwrap_err(),
            TaskError::UndeclaredProvider { .. }
        ));
    }

    #[test]
    fn test_provided_value_type_is_checked() {
        let producer = TaskDefinition::builder("setup")
            .export("config", config().export())
            .run(|_| Ok(TaskRun::new().provide("config", 42u32)));
        let consumer = TaskDefinition::builder("main")
            .dependency("config", config().dependency())
            .run(|_| Ok(TaskRun::new()));
        let graph = build_graph(
            GeneratorBundle::new("app", "gen/app")
                .task(producer)
                .child("child", GeneratorBundle::new("child", "gen/child").task(consumer)),
        );

        let err = run_task_graph(&graph, &options(2)).unwrap_err();
        assert!(matches!(
            err,
            TaskError::ProviderTypeMismatch { ref task, ref key, .. }
                if task == "root#setup" && key == "config"
        ));
    }

    #[test]
    fn test_concurrency_limit_is_respected() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers = ["a", "b", "c", "d", "e", "f", "g", "h"].map(|name| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            let task = TaskDefinition::builder("main").run(move |_| {
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(TaskRun::new())
            });
            (name, GeneratorBundle::new("worker", "gen/worker").task(task))
        });
        let graph = build_graph(GeneratorBundle::new("app", "gen/app").children("workers", workers));

        run_task_graph(&graph, &options(2)).unwrap();
        let peak = peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak of {peak} tasks in flight");
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_worker_pool_size() {
        let pool = worker_pool(Some(3)).unwrap();
        assert_eq!(pool.current_num_threads(), 3);
        assert_eq!(pool.install(rayon::current_num_threads), 3);

        let pool = worker_pool(Some(0)).unwrap();
        assert_eq!(pool.current_num_threads(), 1);
    }

    #[test]
    fn test_dependent_starts_after_producer_finishes() {
        let producer_done = Arc::new(AtomicBool::new(false));
        let done = producer_done.clone();
        let observed = Arc::new(AtomicBool::new(false));
        let seen = observed.clone();

        let producer = TaskDefinition::builder("setup")
            .export("config", config().export())
            .run(move |_| {
                let done = done.clone();
                std::thread::sleep(Duration::from_millis(20));
                Ok(TaskRun::new()
                    .provide("config", String::new())
                    .build(move |_| {
                        std::thread::sleep(Duration::from_millis(20));
                        done.store(true, Ordering::SeqCst);
                        Ok(BuildOutput::new())
                    }))
            });
        let consumer = TaskDefinition::builder("main")
            .dependency("config", config().dependency())
            .run(move |_| {
                seen.store(producer_done.load(Ordering::SeqCst), Ordering::SeqCst);
                Ok(TaskRun::new())
            });
        let graph = build_graph(GeneratorBundle::new("app", "gen/app").task(consumer).task(producer));

        run_task_graph(&graph, &options(4)).unwrap();
        assert!(observed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_duplicate_file_across_tasks() {
        let writer = |name: &str| {
            TaskDefinition::builder(name).run(|_| {
                Ok(TaskRun::new().build(|_| {
                    Ok(BuildOutput::new().action(WriteFile::new("package.json", "{}")))
                }))
            })
        };
        let graph = build_graph(
            GeneratorBundle::new("node", "gen/node")
                .task(writer("a"))
                .task(writer("b")),
        );

        assert!(matches!(
            run_task_graph(&graph, &options(2)).unwrap_err(),
            TaskError::Output(_)
        ));
    }

    #[test]
    fn test_cancelled_before_spawn() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = TaskDefinition::builder("main").run(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(TaskRun::new())
        });
        let graph = build_graph(GeneratorBundle::new("app", "gen/app").task(task));

        let options = options(1);
        options.cancel.cancel();
        assert!(matches!(
            run_task_graph(&graph, &options).unwrap_err(),
            TaskError::Cancelled
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_diagnostics_mermaid() {
        let producer = TaskDefinition::builder("setup")
            .export("config", config().export())
            .run(|_| Ok(TaskRun::new().provide("config", String::new())));
        let consumer = TaskDefinition::builder("main")
            .dependency("config", config().dependency())
            .run(|_| Ok(TaskRun::new()));
        let graph = build_graph(GeneratorBundle::new("app", "gen/app").task(producer).task(consumer));

        let run = run_task_graph(&graph, &options(1)).unwrap();
        let mermaid = run.diagnostics.render_mermaid(&graph);

        assert!(mermaid.starts_with("graph LR\n"));
        assert!(mermaid.contains("[\"root#setup\\n"));
        assert!(mermaid.contains(" -- \"config\" --> "));
        assert_eq!(mermaid.matches("style ").count(), 2);
    }

    #[test]
    fn test_diagnostics_slowest() {
        let mut diagnostics = Diagnostics::default();
        let now = Instant::now();
        for (id, ms) in [("root#a", 5), ("root#b", 20), ("root#c", 1)] {
            diagnostics.execution_times.insert(
                id.to_string(),
                TaskExecution {
                    start: now,
                    duration: Duration::from_millis(ms),
                },
            );
        }

        let ids: Vec<_> = diagnostics.slowest().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, ["root#b", "root#a", "root#c"]);
    }
}
