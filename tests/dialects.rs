//! Assembler text in every dialect for the reference functions.

mod common;

use portasm::{
    begin_function, emit, encode, to_text, ArgType, Architecture, Argument, CallingConvention,
    Dialect, Emitted, ErrorKind, Function, MemoryOperand, Opcode, OutputMode, WidthClass,
};

fn float_function() -> Function {
    let x = Argument::new("x", ArgType::Float64);
    let y = Argument::new("y", ArgType::Float64);
    let mut b = begin_function("fmul", vec![x.clone(), y.clone()], Some(ArgType::Float64));
    let a = b.issue_register(WidthClass::Xmm);
    let c = b.issue_register(WidthClass::Xmm);
    b.load_argument(&x, a).unwrap();
    b.load_argument(&y, c).unwrap();
    b.emit(Opcode::Mulsd, vec![a.into(), c.into()]).unwrap();
    b.ret(Some(a.into())).unwrap();
    b.end_function().unwrap()
}

fn vector_function() -> Function {
    let p = Argument::new("p", ArgType::ptr_to(ArgType::U32));
    let mut b = begin_function("twice", vec![p.clone()], None);
    let base = b.issue_register(WidthClass::Gp64);
    let v = b.issue_register(WidthClass::Xmm);
    b.load_argument(&p, base).unwrap();
    b.emit(Opcode::Movdqu, vec![v.into(), MemoryOperand::base(base).into()])
        .unwrap();
    b.emit(Opcode::Paddd, vec![v.into(), v.into()]).unwrap();
    b.emit(Opcode::Movdqu, vec![MemoryOperand::base(base).into(), v.into()])
        .unwrap();
    b.ret(None).unwrap();
    b.end_function().unwrap()
}

fn wide_function() -> Function {
    let p = Argument::new("p", ArgType::ptr_to(ArgType::U64));
    let mut b = begin_function("wide", vec![p.clone()], None);
    let base = b.issue_register(WidthClass::Gp64);
    let v = b.issue_register(WidthClass::Ymm);
    b.load_argument(&p, base).unwrap();
    b.emit(Opcode::Vmovdqu, vec![v.into(), MemoryOperand::base(base).into()])
        .unwrap();
    b.emit(Opcode::Vpaddq, vec![v.into(), v.into(), v.into()]).unwrap();
    b.emit(Opcode::Vmovdqu, vec![MemoryOperand::base(base).into(), v.into()])
        .unwrap();
    b.ret(None).unwrap();
    b.end_function().unwrap()
}

fn encoded(function: &Function, convention: CallingConvention) -> portasm::EncodedFunction {
    encode(function, Architecture::X86_64, convention).unwrap()
}

#[test]
fn test_banner_in_every_dialect() {
    common::init_logging();
    let encoded = encoded(&common::add_function(), CallingConvention::GoAmd64);
    for dialect in Dialect::ALL {
        let text = to_text(&encoded, dialect).unwrap();
        let c = dialect.comment();
        assert!(text.contains(&format!("{c} Generated by portasm\n")), "{dialect}");
        assert!(text.contains("func add(f1 uint64, f2 uint16) uint64"), "{dialect}");
        assert!(text.contains(&format!("{c} convention: go, {} bytes", encoded.size())));
        assert!(text.contains("f2: u16 in [rsp+16]"), "{dialect}");
        assert!(text.contains("return: u64 in [rsp+24]"), "{dialect}");
    }
}

#[test]
fn test_c_banner_uses_c_prototype() {
    let encoded = encoded(&common::slice_sum_function(), CallingConvention::SystemV);
    let text = to_text(&encoded, Dialect::Nasm).unwrap();
    assert!(text.starts_with("; Generated by portasm\n"));
    assert!(text.contains("uint64_t sum(uint64_t* ptr, size_t len, size_t cap)"));
    assert!(text.contains(";   ptr: *u64 in rdi"));
    assert!(text.contains(";   return: u64 in rax"));
}

#[test]
fn test_gas_uses_att_operands() {
    let encoded = encoded(&common::add_function(), CallingConvention::SystemV);
    let text = to_text(&encoded, Dialect::Gas).unwrap();
    assert!(text.contains("\t.text\n"));
    assert!(text.contains("\t.p2align 4\n"));
    assert!(text.contains("add:\n"));
    assert!(text.contains("movzwl") || text.contains("movzwq"), "{text}");
    assert!(text.contains("%rdi"));
    assert!(text.contains("retq") || text.contains("\tret"));
}

#[test]
fn test_labels_per_dialect() {
    let function = common::slice_sum_function();
    let go = encoded(&function, CallingConvention::GoAmd64);
    let begin = go.labels.iter().find(|l| l.label.name().ends_with("_begin")).unwrap();
    let name = begin.label.name();

    let gas = to_text(&go, Dialect::Gas).unwrap();
    assert!(gas.contains(&format!(".L{name}:")));
    assert!(gas.contains(&format!("jne .L{name}")));

    let nasm = to_text(&go, Dialect::Nasm).unwrap();
    assert!(nasm.contains(&format!("\n.{name}:")));
    assert!(nasm.contains(&format!("jne .{name}")));

    let masm = to_text(&go, Dialect::Masm).unwrap();
    assert!(masm.contains(&format!("\n{name}:")));
    assert!(masm.contains(&format!("jne {name}")));

    let plan9 = to_text(&go, Dialect::Go).unwrap();
    assert!(plan9.contains(&format!("\n{name}:")));
    assert!(plan9.contains(&format!("JNE {name}")));
    assert!(plan9.contains("JEQ "));
}

#[test]
fn test_go_listing_header() {
    let encoded = encoded(&common::slice_sum_function(), CallingConvention::GoAmd64);
    let text = to_text(&encoded, Dialect::Go).unwrap();
    assert!(text.starts_with("// Code generated by portasm. DO NOT EDIT.\n"));
    assert!(text.contains("#include \"textflag.h\""));
    assert!(text.contains("TEXT ·sum(SB),NOSPLIT,$0-32"));
    assert!(text.contains("MOVQ ptr+0(FP), "));
    assert!(text.contains("ADDQ $8, "));
    assert!(text.contains("DECQ "));
    assert!(text.trim_end().ends_with("RET"));
}

#[test]
fn test_go_float_listing() {
    let encoded = encoded(&float_function(), CallingConvention::GoAmd64);
    let text = to_text(&encoded, Dialect::Go).unwrap();
    assert!(text.contains("MOVSD x+0(FP), X"), "{text}");
    assert!(text.contains("MOVSD y+8(FP), X"), "{text}");
    assert!(text.contains("MULSD X"), "{text}");
    assert!(text.contains(", ret+16(FP)"), "{text}");
}

#[test]
fn test_vector_listings() {
    let go = encoded(&vector_function(), CallingConvention::GoAmd64);
    let plan9 = to_text(&go, Dialect::Go).unwrap();
    assert!(plan9.contains("MOVOU (AX), X"), "{plan9}");
    assert!(plan9.contains("PADDL X"), "{plan9}");

    let sysv = encoded(&vector_function(), CallingConvention::SystemV);
    let gas = to_text(&sysv, Dialect::Gas).unwrap();
    assert!(gas.contains("movdqu (%rdi), %xmm"), "{gas}");
    assert!(gas.contains("paddd"), "{gas}");
    let intel = to_text(&sysv, Dialect::Nasm).unwrap();
    assert!(intel.contains("movdqu xmm"), "{intel}");
}

#[test]
fn test_ymm_listing_ends_with_vzeroupper() {
    let encoded = encoded(&wide_function(), CallingConvention::SystemV);
    assert!(encoded.frame.vzeroupper);
    let gas = to_text(&encoded, Dialect::Gas).unwrap();
    assert!(gas.contains("%ymm"));
    let tail: Vec<&str> = gas.lines().rev().take(2).collect();
    assert!(tail[0].contains("ret"));
    assert!(tail[1].contains("vzeroupper"));

    // ymm registers are usable inside a Go function; only ymm arguments are not.
    let go = self::encoded(&wide_function(), CallingConvention::GoAmd64);
    assert!(!go.frame.vzeroupper);
    let plan9 = to_text(&go, Dialect::Go).unwrap();
    assert!(plan9.contains("VPADDQ Y"), "{plan9}");
    assert!(!plan9.contains("VZEROUPPER"));
}

#[test]
fn test_go_dialect_rejects_c_convention() {
    let encoded = encoded(&common::add_function(), CallingConvention::Microsoft);
    let err = to_text(&encoded, Dialect::Go).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedTarget);
    assert!(matches!(
        emit(&encoded, OutputMode::Text(Dialect::Masm)).unwrap(),
        Emitted::Text(_)
    ));
}
