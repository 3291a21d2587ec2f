//! Offline snapshot analyzer: instance census, reference-edge dumps, and
//! shortest-path tracing between classes, without running the interpreter.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process;

use clap::Parser;

use smalt_om::object::{ByteString, HeapObject, RegularObject, Value, BYTE_STRING_CID};
use smalt_om::util::constants::BYTES_IN_WORD;
use smalt_om::{snapshot, Heap, HeapOptions};

#[derive(Parser, Debug)]
#[command(name = "heap_analyzer")]
#[command(about = "Inspect a Smalt snapshot: census, reference edges, paths")]
struct Args {
    /// Path to the snapshot image
    snapshot: PathBuf,

    /// Write a CSV of (source, target) reference edges to FILE
    #[arg(long, value_name = "FILE")]
    edges: Option<PathBuf>,

    /// Trace the shortest reference path between two classes
    #[arg(long, value_name = "FROM:TO")]
    trace: Option<String>,
}

fn main() {
    smalt_om::util::logger::init().ok();
    let args = Args::parse();

    let bytes = match fs::read(&args.snapshot) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("heap_analyzer: {}: {}", args.snapshot.display(), e);
            process::exit(2);
        }
    };
    let heap = match snapshot::deserialize(&bytes, HeapOptions::default()) {
        Ok(heap) => heap,
        Err(e) => {
            eprintln!("heap_analyzer: {}: {}", args.snapshot.display(), e);
            process::exit(1);
        }
    };

    count_instances(&heap);

    if let Some(path) = &args.edges {
        if let Err(e) = write_graph(&heap, path) {
            eprintln!("heap_analyzer: {}: {}", path.display(), e);
            process::exit(2);
        }
    }

    if let Some(spec) = &args.trace {
        match spec.split_once(':') {
            Some((from, to)) => trace_path(&heap, from, to),
            None => {
                eprintln!("heap_analyzer: --trace expects FROM:TO, got {:?}", spec);
                process::exit(2);
            }
        }
    }
}

/// Resolve a cid to a printable class name through the class table. A
/// metaclass names itself after the class in its this-class slot.
fn class_name(heap: &Heap, cid: usize) -> String {
    let behavior = heap.class_at(cid);
    if !behavior.is_heap_object() {
        return format!("class-{}", cid);
    }
    let named = |value: Value| -> Option<String> {
        if value.is_heap_object() && value.heap_object().cid() == BYTE_STRING_CID {
            let name = ByteString::cast(value.heap_object());
            Some(String::from_utf8_lossy(name.as_bytes()).into_owned())
        } else {
            None
        }
    };
    let regular = RegularObject::cast(behavior.heap_object());
    const NAME_SLOT: usize = smalt_om::object::Behavior::NAME_SLOT;
    if regular.num_slots() <= NAME_SLOT {
        return format!("class-{}", cid);
    }
    let name_slot = regular.slot(NAME_SLOT);
    if let Some(name) = named(name_slot) {
        return name;
    }
    // A metaclass: the slot holds the class whose metaclass this is.
    if name_slot.is_heap_object() {
        let this_class = RegularObject::cast(name_slot.heap_object());
        if this_class.num_slots() > NAME_SLOT {
            if let Some(name) = named(this_class.slot(NAME_SLOT)) {
                return format!("{} class", name);
            }
        }
    }
    format!("class-{}", cid)
}

fn count_instances(heap: &Heap) {
    let mut census: HashMap<usize, (usize, usize)> = HashMap::new();
    heap.walk(|object| {
        let entry = census.entry(object.cid()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += object.heap_size();
    });

    let mut entries: Vec<(String, usize, usize)> = census
        .into_iter()
        .map(|(cid, (count, bytes))| (class_name(heap, cid), count, bytes))
        .collect();
    entries.sort_by(|a, b| b.2.cmp(&a.2));

    println!("{:>60} {:>10} {:>10}", "Class", "Instances", "Bytes");
    let mut total_count = 0;
    let mut total_bytes = 0;
    for (name, count, bytes) in &entries {
        println!("{:>60} {:>10} {:>10}", name, count, bytes);
        total_count += count;
        total_bytes += bytes;
    }
    println!("{:>60} {:>10} {:>10}", "Total", total_count, total_bytes);
}

fn each_reference<F: FnMut(HeapObject)>(object: HeapObject, mut f: F) {
    if let Some((from, to)) = object.pointers() {
        let mut slot = from;
        while slot <= to {
            let value = unsafe { slot.load::<Value>() };
            if value.is_heap_object() {
                f(value.heap_object());
            }
            slot += BYTES_IN_WORD;
        }
    }
}

fn write_graph(heap: &Heap, path: &PathBuf) -> std::io::Result<()> {
    let mut out = std::io::BufWriter::new(fs::File::create(path)?);
    writeln!(out, "source,target")?;
    let mut result = Ok(());
    heap.walk(|source| {
        let source_class = class_name(heap, source.cid());
        each_reference(source, |target| {
            if result.is_ok() {
                result = writeln!(
                    out,
                    "{}@{:x},{}@{:x}",
                    source_class,
                    source.address().as_usize(),
                    class_name(heap, target.cid()),
                    target.address().as_usize()
                );
            }
        });
    });
    result
}

/// Breadth-first search for the shortest reference path from any instance
/// of `from_class` to any instance of `to_class`.
fn trace_path(heap: &Heap, from_class: &str, to_class: &str) {
    let mut queue = VecDeque::new();
    let mut parent: HashMap<usize, Option<usize>> = HashMap::new();
    let mut by_address: HashMap<usize, HeapObject> = HashMap::new();
    heap.walk(|object| {
        by_address.insert(object.address().as_usize(), object);
        if class_name(heap, object.cid()) == from_class {
            parent.insert(object.address().as_usize(), None);
            queue.push_back(object);
        }
    });
    if queue.is_empty() {
        println!("No instances of {}", from_class);
        return;
    }

    while let Some(next) = queue.pop_front() {
        if class_name(heap, next.cid()) == to_class {
            let mut segments = Vec::new();
            let mut cursor = Some(next.address().as_usize());
            while let Some(addr) = cursor {
                let object = by_address[&addr];
                segments.push(format!("{}@{:x}", class_name(heap, object.cid()), addr));
                cursor = parent[&addr];
            }
            println!("Found path: {}", segments.join(" <- "));
            return;
        }
        each_reference(next, |target| {
            let addr = target.address().as_usize();
            if !parent.contains_key(&addr) {
                parent.insert(addr, Some(next.address().as_usize()));
                queue.push_back(target);
            }
        });
    }
    println!("No path from {} to {}", from_class, to_class);
}
